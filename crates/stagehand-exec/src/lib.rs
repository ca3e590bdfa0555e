//! # stagehand-exec: the action-execution protocol
//!
//! An [`ActionExecutor`] turns one action into one observation inside a
//! sandbox. Sandboxes that live in another process or on another host expose
//! the same contract over HTTP/JSON:
//!
//! | Endpoint | Reply |
//! |---|---|
//! | `GET /alive` | `{"status":"ok"}` |
//! | `GET /server_info` | [`ServerInfo`] |
//! | `POST /execute_action` | [`ExecuteResponse`] or [`ErrorResponse`] |
//!
//! [`HttpActionClient`] is the client side; the server lives in the
//! `stagehand-server` app.

pub mod client;
pub mod executor;
pub mod retry;

pub use client::{HttpActionClient, HttpConnector};
pub use executor::{
    ActionExecutor, AliveResponse, DEFAULT_ACTION_TIMEOUT_SECS, ErrorResponse, ExecuteRequest,
    ExecuteResponse, ExecutorConnector, FnConnector, ServerInfo, kind_for_status, status_for,
};
pub use retry::{BackoffPolicy, retry_idempotent};

pub use tokio_util::sync::CancellationToken;
