//! The event envelope shared by every producer and subscriber.
//!
//! Producers build an [`EventDraft`]; only the event stream turns a draft into
//! an [`Event`], which is where `id`, `timestamp` and `source` get assigned.
//! Once appended an event is never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::ids::EventId;
use crate::observation::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    User,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Action,
    Observation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::Action(_) => EventCategory::Action,
            EventPayload::Observation(_) => EventCategory::Observation,
        }
    }
}

/// Field names the stream never redacts.
pub const IDENTITY_FIELDS: [&str; 5] = ["id", "timestamp", "source", "cause", "timeout"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<EventId>,
    /// Seconds the action may run before the client gives up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub payload: EventPayload,
}

impl Event {
    /// Build an appended event. Reserved for the stream.
    #[doc(hidden)]
    pub fn assemble(id: EventId, source: EventSource, draft: EventDraft) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            source,
            cause: draft.cause,
            timeout: draft.timeout,
            payload: draft.payload,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(observation) => Some(observation),
            EventPayload::Action(_) => None,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.payload {
            EventPayload::Action(action) => action.kind.name(),
            EventPayload::Observation(_) => "observation",
        }
    }
}

/// An event as submitted by a producer, before the stream assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub payload: EventPayload,
    pub cause: Option<EventId>,
    pub timeout: Option<u64>,
}

impl EventDraft {
    pub fn action(action: Action) -> Self {
        Self {
            payload: EventPayload::Action(action),
            cause: None,
            timeout: None,
        }
    }

    pub fn observation(observation: Observation, cause: EventId) -> Self {
        Self {
            payload: EventPayload::Observation(observation),
            cause: Some(cause),
            timeout: None,
        }
    }

    pub fn caused_by(mut self, cause: EventId) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ObservationKind;

    #[test]
    fn event_roundtrip_keeps_every_field() {
        let draft = EventDraft::observation(
            Observation::new(
                ObservationKind::CmdOutput {
                    command: "ls".into(),
                    exit_code: 0,
                },
                "a\nb",
            ),
            EventId(3),
        )
        .with_timeout(30);
        let event = Event::assemble(EventId(4), EventSource::Environment, draft);

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.cause, Some(EventId(3)));
        assert_eq!(back.category(), EventCategory::Observation);
    }

    #[test]
    fn timestamp_serializes_as_iso8601() {
        let event = Event::assemble(
            EventId(0),
            EventSource::Agent,
            EventDraft::action(Action::cmd("pwd")),
        );
        let json = serde_json::to_value(&event).unwrap();
        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert_eq!(json["payload"]["type"], "action");
        assert!(json.get("cause").is_none());
    }
}
