//! # stagehand-protocol: shared contract types
//!
//! Dependency-light types every other crate agrees on. No runtime deps
//! (tokio, reqwest, axum) so it can be used as a pure contract crate.
//!
//! - [`ids`]: `SessionId`, `EventId`
//! - [`event`]: `Event`, `EventDraft`, `EventSource`, `EventPayload`
//! - [`action`]: `Action`, `ActionKind`, confirmation and risk levels
//! - [`observation`]: `Observation`, `ObservationKind`, content truncation
//! - [`error`]: `ExecutionError` and its wire form

pub mod action;
pub mod error;
pub mod event;
pub mod ids;
pub mod observation;

pub use action::{Action, ActionKind, ConfirmationStatus, SecurityRisk};
pub use error::{ErrorBody, ExecutionError, ExecutionErrorKind, ExecutionResult};
pub use event::{Event, EventCategory, EventDraft, EventPayload, EventSource, IDENTITY_FIELDS};
pub use ids::{EventId, SessionId};
pub use observation::{
    DEFAULT_MAX_OBSERVATION_CHARS, Observation, ObservationKind, truncate_content,
};
