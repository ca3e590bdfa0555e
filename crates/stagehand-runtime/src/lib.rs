//! # stagehand-runtime: control flags and the session controller
//!
//! [`SessionController`] is what a decision loop talks to. Per submitted
//! action it steps the [`ControlFlag`]s, asks the optional
//! [`SecurityAnalyzer`] for a risk rating, parks high-risk actions until
//! they are confirmed, runs confirmed ones through the sandbox lifecycle
//! manager and appends the observation to the session's event stream.

pub mod analyzer;
pub mod controller;
pub mod flags;

pub use analyzer::{PatternAnalyzer, SecurityAnalyzer};
pub use controller::{
    ControllerError, ExecutionSettings, LimitSettings, SessionController, StepOutcome,
};
pub use flags::{BudgetFlag, ControlFlag, FlagError, FlagValue, IterationFlag};
