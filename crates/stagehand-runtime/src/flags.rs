//! Bounded counters gating the agent loop.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric types a [`ControlFlag`] can count in.
pub trait FlagValue: Copy + PartialOrd + fmt::Display + Send + Sync + 'static {
    /// What one `step()` adds.
    const STEP: Self;

    fn add(self, other: Self) -> Self;
}

impl FlagValue for u64 {
    const STEP: Self = 1;

    fn add(self, other: Self) -> Self {
        self.saturating_add(other)
    }
}

/// Budget flags accrue spend through [`ControlFlag::record`]; a step only checks.
impl FlagValue for f64 {
    const STEP: Self = 0.0;

    fn add(self, other: Self) -> Self {
        self + other
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlagError {
    #[error("{name} limit reached: {current} of {limit}")]
    LimitExceeded {
        name: String,
        current: String,
        limit: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFlag<T> {
    pub name: String,
    pub current_value: T,
    pub limit: T,
    pub limit_increase_amount: T,
}

impl<T: FlagValue> ControlFlag<T> {
    pub fn new(name: impl Into<String>, start: T, limit: T, limit_increase_amount: T) -> Self {
        Self {
            name: name.into(),
            current_value: start,
            limit,
            limit_increase_amount,
        }
    }

    pub fn reached_limit(&self) -> bool {
        self.current_value >= self.limit
    }

    /// Count one unit, or refuse once the limit has been reached.
    pub fn step(&mut self) -> Result<(), FlagError> {
        if self.reached_limit() {
            return Err(FlagError::LimitExceeded {
                name: self.name.clone(),
                current: self.current_value.to_string(),
                limit: self.limit.to_string(),
            });
        }
        self.current_value = self.current_value.add(T::STEP);
        Ok(())
    }

    /// Accrue an amount without checking the limit.
    pub fn record(&mut self, amount: T) {
        self.current_value = self.current_value.add(amount);
    }

    pub fn increase_limit(&mut self, amount: T) {
        self.limit = self.limit.add(amount);
    }

    pub fn increase_by_default(&mut self) {
        self.increase_limit(self.limit_increase_amount);
    }
}

pub type IterationFlag = ControlFlag<u64>;
pub type BudgetFlag = ControlFlag<f64>;
