//! # stagehand-events: the session event stream
//!
//! Every action and observation of a session flows through one
//! [`EventStream`]: it assigns ids, redacts secrets, persists the log in
//! checksummed pages and fans events out to subscribers, each on its own
//! worker so a slow or failing subscriber never holds back the others.

pub mod error;
pub mod redact;
pub mod store;
pub mod stream;
pub mod subscriber;

pub use error::{StreamError, StreamResult};
pub use redact::{REDACTED, SecretRegistry, redact_event};
pub use store::{EventPage, FilePageStore, InMemoryPageStore, PageStore};
pub use stream::{EventFilter, EventStream, SearchQuery, StreamConfig};
pub use subscriber::{EventSubscriber, SubscriberKind, SubscriptionId, subscriber_fn};
