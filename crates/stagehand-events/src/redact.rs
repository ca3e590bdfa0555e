//! Secret redaction applied to every event before it is stored or delivered.

use std::sync::Arc;

use parking_lot::RwLock;
use stagehand_protocol::{ActionKind, Event, EventPayload, ObservationKind};

pub const REDACTED: &str = "<secret_hidden>";

/// Live set of secret values for one stream.
///
/// Readers take a snapshot; writers replace the whole list, so an append sees
/// either the old or the new set, never a mix.
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    values: Arc<RwLock<Arc<Vec<String>>>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        *self.values.write() = Arc::new(values);
    }

    pub fn add(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.is_empty() {
            return;
        }
        let mut guard = self.values.write();
        if guard.contains(&secret) {
            return;
        }
        let mut next = guard.as_ref().clone();
        next.push(secret);
        *guard = Arc::new(next);
    }

    pub fn clear(&self) {
        *self.values.write() = Arc::new(Vec::new());
    }

    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.values.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

/// Replace every occurrence of a secret in `event`'s free-text values.
///
/// Only payload text is rewritten. The envelope's identity fields and the
/// enum tags of the payload keep their values, so the event always stays
/// well-formed.
pub fn redact_event(mut event: Event, secrets: &[String]) -> Event {
    if secrets.is_empty() {
        return event;
    }
    for text in payload_text_mut(&mut event.payload) {
        if let Some(clean) = redact_text(text, secrets) {
            *text = clean;
        }
    }
    event
}

fn payload_text_mut(payload: &mut EventPayload) -> Vec<&mut String> {
    match payload {
        EventPayload::Action(action) => match &mut action.kind {
            ActionKind::CmdRun { command, cwd } => {
                let mut fields = vec![command];
                fields.extend(cwd.as_mut());
                fields
            }
            ActionKind::FileRead { path, .. } => vec![path],
            ActionKind::FileWrite { path, content } => vec![path, content],
            ActionKind::FileEdit {
                path,
                old_str,
                new_str,
            } => vec![path, old_str, new_str],
            ActionKind::BrowseUrl { url } => vec![url],
            ActionKind::Message { content } => vec![content],
            ActionKind::Finish { summary } => vec![summary],
        },
        EventPayload::Observation(observation) => {
            let mut fields = vec![&mut observation.content];
            match &mut observation.kind {
                ObservationKind::CmdOutput { command, .. } => fields.push(command),
                ObservationKind::FileRead { path }
                | ObservationKind::FileWrite { path }
                | ObservationKind::FileEdit { path } => fields.push(path),
                ObservationKind::Browse { url, .. } => fields.push(url),
                ObservationKind::Error { .. }
                | ObservationKind::Timeout { .. }
                | ObservationKind::Rejected => {}
            }
            fields
        }
    }
}

/// Hide the union of every secret occurrence, overlapping ones included.
/// Each run of covered bytes becomes a single marker, so a secret that is a
/// prefix or a fragment of another never leaves part of the longer one behind.
fn redact_text(text: &str, secrets: &[String]) -> Option<String> {
    let mut covered: Vec<(usize, usize)> = Vec::new();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        let step = secret.chars().next().map_or(1, char::len_utf8);
        let mut from = 0;
        while let Some(offset) = text[from..].find(secret.as_str()) {
            let at = from + offset;
            covered.push((at, at + secret.len()));
            from = at + step;
        }
    }
    if covered.is_empty() {
        return None;
    }

    covered.sort_unstable();
    let mut out = String::with_capacity(text.len());
    let mut written = 0;
    let mut iter = covered.into_iter().peekable();
    while let Some((start, mut end)) = iter.next() {
        while let Some(&(next_start, next_end)) = iter.peek() {
            if next_start > end {
                break;
            }
            end = end.max(next_end);
            iter.next();
        }
        out.push_str(&text[written..start]);
        out.push_str(REDACTED);
        written = end;
    }
    out.push_str(&text[written..]);
    Some(out)
}
