use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stagehand_protocol::{Event, EventCategory, EventDraft, EventId, EventSource, SessionId};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{StreamError, StreamResult};
use crate::redact::{SecretRegistry, redact_event};
use crate::store::{EventPage, PageStore};
use crate::subscriber::{EventSubscriber, SubscriberKind, Subscription, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Events per stored page.
    pub page_size: usize,
    /// Completed pages kept in memory besides the open one.
    pub cache_pages: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            cache_pages: 4,
        }
    }
}

/// Restricts which events a search yields. Every set criterion must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub sources: Option<Vec<EventSource>>,
    pub category: Option<EventCategory>,
    pub cause: Option<EventId>,
    /// Case-insensitive substring of the serialized payload.
    pub text: Option<String>,
}

impl EventFilter {
    pub fn source(mut self, source: EventSource) -> Self {
        self.sources.get_or_insert_with(Vec::new).push(source);
        self
    }

    pub fn category(mut self, category: EventCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn caused_by(mut self, cause: EventId) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if self.category.is_some_and(|category| event.category() != category) {
            return false;
        }
        if self.cause.is_some_and(|cause| event.cause != Some(cause)) {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let haystack = serde_json::to_string(&event.payload)
                .unwrap_or_default()
                .to_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub start_id: EventId,
    /// Inclusive. Defaults to the latest id at the time `search` is called.
    pub end_id: Option<EventId>,
    pub reverse: bool,
    pub filter: Option<EventFilter>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from(mut self, start: EventId) -> Self {
        self.start_id = start;
        self
    }

    pub fn until(mut self, end: EventId) -> Self {
        self.end_id = Some(end);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn filtered(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

struct WriterState {
    open_page: Vec<Event>,
}

struct Inner {
    session_id: SessionId,
    config: StreamConfig,
    store: Arc<dyn PageStore>,
    secrets: SecretRegistry,
    writer: tokio::sync::Mutex<WriterState>,
    /// Number of committed events; also the next id to assign.
    committed: AtomicU64,
    cache: RwLock<BTreeMap<u64, Arc<Vec<Event>>>>,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Subscription>>,
    next_subscription: AtomicU64,
    halted: Mutex<Option<String>>,
}

/// Append-only, paged event log of one session with fan-out to subscribers.
///
/// Cloning is cheap and every clone refers to the same log.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.inner.session_id)
            .field("committed", &self.inner.committed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Open the stream for `session_id`, resuming whatever the store already
    /// holds for it.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn open(
        session_id: SessionId,
        store: Arc<dyn PageStore>,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        if config.page_size == 0 {
            return Err(StreamError::Storage("page_size must be positive".into()));
        }
        let indices = store
            .page_indices(&session_id)
            .await
            .map_err(|e| StreamError::Storage(format!("{e:#}")))?;
        for (expected, index) in indices.iter().enumerate() {
            if *index != expected as u64 {
                return Err(StreamError::Integrity(format!(
                    "missing event page {expected} for session {session_id}"
                )));
            }
        }

        let mut open_page = Vec::new();
        let mut committed = 0_u64;
        let mut cache = BTreeMap::new();
        if let Some(last) = indices.last().copied() {
            let page = store
                .read_page(&session_id, last)
                .await
                .map_err(|e| StreamError::Storage(format!("{e:#}")))?
                .ok_or_else(|| {
                    StreamError::Integrity(format!("event page {last} vanished during open"))
                })?;
            page.verify(config.page_size)
                .map_err(StreamError::Integrity)?;
            committed = last * config.page_size as u64 + page.events.len() as u64;
            if page.events.len() < config.page_size {
                open_page = page.events.clone();
            }
            cache.insert(last, Arc::new(page.events));
            info!(events = committed, pages = indices.len(), "event stream resumed");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                session_id,
                config,
                store,
                secrets: SecretRegistry::new(),
                writer: tokio::sync::Mutex::new(WriterState { open_page }),
                committed: AtomicU64::new(committed),
                cache: RwLock::new(cache),
                subscriptions: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(0),
                halted: Mutex::new(None),
            }),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn config(&self) -> StreamConfig {
        self.inner.config
    }

    /// Secret values redacted from every later append.
    pub fn secrets(&self) -> &SecretRegistry {
        &self.inner.secrets
    }

    pub fn latest_id(&self) -> Option<EventId> {
        match self.inner.committed.load(Ordering::Acquire) {
            0 => None,
            n => Some(EventId(n - 1)),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.lock().is_some()
    }

    fn ensure_live(&self) -> StreamResult<()> {
        match self.inner.halted.lock().as_ref() {
            Some(reason) => Err(StreamError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&self, reason: &str) {
        let mut halted = self.inner.halted.lock();
        if halted.is_none() {
            error!(session_id = %self.inner.session_id, reason, "event stream halted");
            *halted = Some(reason.to_owned());
        }
    }

    /// Assign the next id, persist, then hand the event to every subscriber.
    ///
    /// Returns once the page holding the event is stored; delivery happens
    /// asynchronously on each subscription's worker.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id, ?source))]
    pub async fn append(&self, draft: EventDraft, source: EventSource) -> StreamResult<EventId> {
        self.ensure_live()?;
        let mut writer = self.inner.writer.lock().await;
        self.ensure_live()?;

        let id = EventId(self.inner.committed.load(Ordering::Acquire));
        if let Some(cause) = draft.cause.filter(|cause| *cause >= id) {
            return Err(StreamError::Causality { id, cause });
        }

        let secrets = self.inner.secrets.snapshot();
        let event = redact_event(Event::assemble(id, source, draft), &secrets);
        let page_size = self.inner.config.page_size;
        let page_index = id.value() / page_size as u64;

        writer.open_page.push(event.clone());
        let page = match EventPage::seal(
            self.inner.session_id.clone(),
            page_index,
            writer.open_page.clone(),
        ) {
            Ok(page) => page,
            Err(e) => {
                writer.open_page.pop();
                return Err(StreamError::Serialization(format!("{e:#}")));
            }
        };
        if let Err(e) = self.inner.store.write_page(&page).await {
            writer.open_page.pop();
            let reason = format!("failed persisting event {id}: {e:#}");
            self.halt(&reason);
            return Err(StreamError::Storage(reason));
        }

        self.cache_page(page_index, Arc::new(page.events));
        if writer.open_page.len() >= page_size {
            writer.open_page.clear();
        }
        self.inner.committed.store(id.value() + 1, Ordering::Release);

        // Still under the writer lock, so every queue sees ids in order.
        let event = Arc::new(event);
        let subscriptions = self.inner.subscriptions.lock();
        for (subscription_id, subscription) in subscriptions.iter() {
            if subscription.sender.send(Arc::clone(&event)).is_err() {
                debug!(subscription = %subscription_id, "subscription worker already gone");
            }
        }
        debug!(event_id = %id, kind = event.kind_name(), subscribers = subscriptions.len(), "event appended");
        Ok(id)
    }

    fn cache_page(&self, index: u64, events: Arc<Vec<Event>>) {
        let mut cache = self.inner.cache.write();
        cache.insert(index, events);
        let keep_from = index.saturating_sub(self.inner.config.cache_pages as u64);
        cache.retain(|page, _| *page >= keep_from);
    }

    async fn load_page(&self, index: u64) -> StreamResult<Arc<Vec<Event>>> {
        if let Some(page) = self.inner.cache.read().get(&index) {
            return Ok(Arc::clone(page));
        }
        let page = self
            .inner
            .store
            .read_page(&self.inner.session_id, index)
            .await
            .map_err(|e| StreamError::Storage(format!("{e:#}")))?;
        let page = match page {
            Some(page) => page,
            None => {
                let reason = format!("event page {index} is missing from storage");
                self.halt(&reason);
                return Err(StreamError::Integrity(reason));
            }
        };
        if let Err(reason) = page.verify(self.inner.config.page_size) {
            self.halt(&reason);
            return Err(StreamError::Integrity(reason));
        }
        Ok(Arc::new(page.events))
    }

    pub async fn get(&self, id: EventId) -> StreamResult<Event> {
        if id.value() >= self.inner.committed.load(Ordering::Acquire) {
            return Err(StreamError::NotFound(id));
        }
        let page_size = self.inner.config.page_size as u64;
        let page = self.load_page(id.value() / page_size).await?;
        let offset = (id.value() % page_size) as usize;
        match page.get(offset) {
            Some(event) => Ok(event.clone()),
            None => {
                let reason = format!("event {id} missing from its stored page");
                self.halt(&reason);
                Err(StreamError::Integrity(reason))
            }
        }
    }

    /// Lazily walk the log.
    ///
    /// Without an `end_id` the range stops at the latest event committed when
    /// this is called. With one, a forward scan also yields events appended
    /// while it runs, up to `end_id`.
    pub fn search(&self, query: SearchQuery) -> BoxStream<'static, StreamResult<Event>> {
        let stream = self.clone();
        let committed = self.inner.committed.load(Ordering::Acquire);
        let page_size = self.inner.config.page_size as u64;
        let limit = query.limit.unwrap_or(usize::MAX);
        let filter = query.filter;
        let start = query.start_id.value();
        let (ids, follow): (Box<dyn Iterator<Item = u64> + Send>, bool) =
            match (query.end_id, query.reverse) {
                (Some(end), false) => (Box::new(start..=end.value()), true),
                (Some(end), true) => {
                    let upper = committed.min(end.value().saturating_add(1));
                    (Box::new((start..upper).rev()), false)
                }
                (None, false) => (Box::new(start..committed), false),
                (None, true) => (Box::new((start..committed).rev()), false),
            };

        let events = async_stream::stream! {
            let mut yielded = 0_usize;
            let mut current: Option<(u64, Arc<Vec<Event>>)> = None;
            for id in ids {
                if yielded >= limit {
                    break;
                }
                if follow && id >= stream.inner.committed.load(Ordering::Acquire) {
                    break;
                }
                let index = id / page_size;
                let offset = (id % page_size) as usize;
                let cached = match &current {
                    Some((loaded, page)) if *loaded == index && offset < page.len() => {
                        Some(Arc::clone(page))
                    }
                    _ => None,
                };
                let page = match cached {
                    Some(page) => page,
                    None => match stream.load_page(index).await {
                        Ok(page) => {
                            current = Some((index, Arc::clone(&page)));
                            page
                        }
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                };
                let Some(event) = page.get(offset).cloned() else {
                    yield Err(StreamError::Integrity(format!(
                        "event {id} missing from its stored page"
                    )));
                    break;
                };
                if filter.as_ref().is_none_or(|f| f.matches(&event)) {
                    yielded += 1;
                    yield Ok::<Event, StreamError>(event);
                }
            }
        };
        events.boxed()
    }

    pub async fn search_collect(&self, query: SearchQuery) -> StreamResult<Vec<Event>> {
        self.search(query).try_collect().await
    }

    /// Register a subscriber. It receives every event appended from now on,
    /// in id order, on a dedicated worker task.
    pub fn subscribe(
        &self,
        kind: SubscriberKind,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscription =
            Subscription::spawn(self.inner.session_id.clone(), id, kind, subscriber);
        self.inner.subscriptions.lock().insert(id, subscription);
        debug!(session_id = %self.inner.session_id, subscription = %id, %kind, "subscribed");
        id
    }

    /// Remove a subscription. Already queued events are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscriptions.lock().remove(&id);
        match removed {
            Some(subscription) => {
                debug!(session_id = %self.inner.session_id, subscription = %id, kind = %subscription.kind, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscriptions(&self) -> Vec<(SubscriptionId, SubscriberKind)> {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .map(|(id, subscription)| (*id, subscription.kind))
            .collect()
    }

    /// Stop accepting appends, drop every subscription and wait for the
    /// workers to deliver what they already hold.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn close(&self) {
        {
            let _writer = self.inner.writer.lock().await;
            let mut halted = self.inner.halted.lock();
            if halted.is_none() {
                *halted = Some("stream closed".into());
            }
        }
        self.inner.store.release(&self.inner.session_id);
        let drained: Vec<Subscription> = std::mem::take(&mut *self.inner.subscriptions.lock())
            .into_values()
            .collect();
        for subscription in drained {
            let Subscription { kind, sender, worker } = subscription;
            drop(sender);
            if let Err(e) = worker.await {
                warn!(%kind, error = %e, "subscription worker ended abnormally");
            }
        }
        info!("event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use async_trait::async_trait;
    use stagehand_protocol::{Action, Observation, ObservationKind};

    use super::*;
    use crate::store::{FilePageStore, InMemoryPageStore};
    use crate::subscriber::subscriber_fn;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn small_pages() -> StreamConfig {
        StreamConfig {
            page_size: 4,
            cache_pages: 1,
        }
    }

    async fn memory_stream(config: StreamConfig) -> Result<(EventStream, InMemoryPageStore)> {
        let store = InMemoryPageStore::new();
        let stream = EventStream::open(
            SessionId::from_string("test-session"),
            Arc::new(store.clone()),
            config,
        )
        .await?;
        Ok((stream, store))
    }

    fn output(content: &str, cause: EventId) -> EventDraft {
        EventDraft::observation(
            Observation::new(
                ObservationKind::CmdOutput {
                    command: "echo".into(),
                    exit_code: 0,
                },
                content,
            ),
            cause,
        )
    }

    #[tokio::test]
    async fn ids_are_gap_free_and_search_is_ordered() -> Result<()> {
        let (stream, _) = memory_stream(small_pages()).await?;
        assert_eq!(stream.latest_id(), None);

        for n in 0..18 {
            let id = stream
                .append(EventDraft::action(Action::cmd(format!("echo {n}"))), EventSource::Agent)
                .await?;
            assert_eq!(id, EventId(n));
        }
        assert_eq!(stream.latest_id(), Some(EventId(17)));

        let all = stream.search_collect(SearchQuery::all()).await?;
        let ids: Vec<u64> = all.iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, (0..18).collect::<Vec<_>>());

        let window = stream
            .search_collect(SearchQuery::all().from(EventId(3)).until(EventId(9)).reversed())
            .await?;
        let ids: Vec<u64> = window.iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![9, 8, 7, 6, 5, 4, 3]);

        let limited = stream.search_collect(SearchQuery::all().limit(2)).await?;
        assert_eq!(limited.len(), 2);

        // Page 0 is long evicted from the cache and is read back from the store.
        assert_eq!(stream.get(EventId(1)).await?.id, EventId(1));
        assert!(matches!(
            stream.get(EventId(18)).await,
            Err(StreamError::NotFound(EventId(18)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn search_is_restartable_and_bounded_at_call_time() -> Result<()> {
        let (stream, _) = memory_stream(small_pages()).await?;
        for _ in 0..3 {
            stream
                .append(EventDraft::action(Action::cmd("true")), EventSource::Agent)
                .await?;
        }
        let pending = stream.search(SearchQuery::all());
        stream
            .append(EventDraft::action(Action::cmd("late")), EventSource::Agent)
            .await?;
        let seen: Vec<Event> = pending.try_collect().await?;
        assert_eq!(seen.len(), 3);

        let again = stream.search_collect(SearchQuery::all()).await?;
        assert_eq!(again.len(), 4);

        // An explicit end follows appends made during the scan, never past it.
        let mut following = stream.search(SearchQuery::all().from(EventId(3)).until(EventId(5)));
        let first = following.next().await.transpose()?;
        assert_eq!(first.map(|e| e.id), Some(EventId(3)));
        for _ in 0..4 {
            stream
                .append(EventDraft::action(Action::cmd("more")), EventSource::Agent)
                .await?;
        }
        let rest: Vec<Event> = following.try_collect().await?;
        let ids: Vec<u64> = rest.iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn cause_must_precede_the_event() -> Result<()> {
        let (stream, _) = memory_stream(StreamConfig::default()).await?;
        let action = stream
            .append(EventDraft::action(Action::cmd("ls")), EventSource::Agent)
            .await?;

        let rejected = stream
            .append(output("nope", EventId(1)), EventSource::Environment)
            .await;
        assert!(matches!(
            rejected,
            Err(StreamError::Causality {
                id: EventId(1),
                cause: EventId(1)
            })
        ));
        assert_eq!(stream.latest_id(), Some(action));

        let observed = stream
            .append(output("ok", action), EventSource::Environment)
            .await?;
        assert_eq!(observed, EventId(1));
        assert_eq!(stream.get(observed).await?.cause, Some(action));
        Ok(())
    }

    #[tokio::test]
    async fn filters_match_source_category_and_text() -> Result<()> {
        let (stream, _) = memory_stream(StreamConfig::default()).await?;
        let first = stream
            .append(EventDraft::action(Action::cmd("cargo build")), EventSource::Agent)
            .await?;
        stream
            .append(output("Compiling stagehand", first), EventSource::Environment)
            .await?;
        stream
            .append(EventDraft::action(Action::message("hello")), EventSource::User)
            .await?;

        let observations = stream
            .search_collect(
                SearchQuery::all().filtered(EventFilter::default().category(EventCategory::Observation)),
            )
            .await?;
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].cause, Some(first));

        let by_text = stream
            .search_collect(SearchQuery::all().filtered(EventFilter::default().text("COMPILING")))
            .await?;
        assert_eq!(by_text.len(), 1);

        let from_user = stream
            .search_collect(
                SearchQuery::all()
                    .reversed()
                    .filtered(EventFilter::default().source(EventSource::User)),
            )
            .await?;
        assert_eq!(from_user.len(), 1);
        assert_eq!(from_user[0].id, EventId(2));
        Ok(())
    }

    #[tokio::test]
    async fn persisted_pages_round_trip_redacted() -> Result<()> {
        let root = unique_test_root("stagehand-stream-redact");
        let session_id = SessionId::from_string("redact-session");
        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::new(&root));

        let stream = EventStream::open(session_id.clone(), Arc::clone(&store), small_pages()).await?;
        stream.secrets().set(["s3cr3t"]);
        let action = stream
            .append(
                EventDraft::action(Action::cmd("export TOKEN=s3cr3t")),
                EventSource::Agent,
            )
            .await?;
        stream
            .append(output("token is s3cr3t", action), EventSource::Environment)
            .await?;
        let before = stream.search_collect(SearchQuery::all()).await?;
        stream.close().await;

        let reopened = EventStream::open(session_id, store, small_pages()).await?;
        let after = reopened.search_collect(SearchQuery::all()).await?;
        assert_eq!(after, before);
        assert_eq!(
            after[1].observation().map(|o| o.content.as_str()),
            Some("token is <secret_hidden>")
        );
        assert!(!serde_json::to_string(&after)?.contains("s3cr3t"));

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn reopening_resumes_ids_after_the_last_page() -> Result<()> {
        let store = InMemoryPageStore::new();
        let session_id = SessionId::from_string("resume");
        let stream =
            EventStream::open(session_id.clone(), Arc::new(store.clone()), small_pages()).await?;
        for _ in 0..6 {
            stream
                .append(EventDraft::action(Action::cmd("true")), EventSource::Agent)
                .await?;
        }
        assert_eq!(store.page_count(&session_id), 2);

        let resumed = EventStream::open(session_id, Arc::new(store), small_pages()).await?;
        assert_eq!(resumed.latest_id(), Some(EventId(5)));
        let next = resumed
            .append(EventDraft::action(Action::cmd("again")), EventSource::Agent)
            .await?;
        assert_eq!(next, EventId(6));
        let ids: Vec<u64> = resumed
            .search_collect(SearchQuery::all())
            .await?
            .iter()
            .map(|e| e.id.value())
            .collect();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_affect_others() -> Result<()> {
        let (stream, _) = memory_stream(StreamConfig::default()).await?;
        let seen = Arc::new(Mutex::new(Vec::new()));

        stream.subscribe(
            SubscriberKind::Test,
            subscriber_fn(|_event| async { Err::<(), _>(anyhow::anyhow!("subscriber exploded")) }),
        );
        stream.subscribe(
            SubscriberKind::Ui,
            subscriber_fn(|event: Arc<Event>| async move {
                if event.id.value() % 2 == 0 {
                    panic!("even ids are not welcome");
                }
                Ok::<(), anyhow::Error>(())
            }),
        );
        let sink = Arc::clone(&seen);
        stream.subscribe(
            SubscriberKind::Memory,
            subscriber_fn(move |event: Arc<Event>| {
                let sink = Arc::clone(&sink);
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    sink.lock().push(event.id.value());
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );

        for _ in 0..10 {
            stream
                .append(EventDraft::action(Action::cmd("true")), EventSource::Agent)
                .await?;
        }
        stream.close().await;

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert!(stream.subscriptions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_delivers_what_was_queued() -> Result<()> {
        let (stream, _) = memory_stream(StreamConfig::default()).await?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let sink = Arc::clone(&seen);
        let wait = Arc::clone(&gate);
        let id = stream.subscribe(
            SubscriberKind::Persistence,
            subscriber_fn(move |event: Arc<Event>| {
                let sink = Arc::clone(&sink);
                let wait = Arc::clone(&wait);
                async move {
                    let _permit = wait.acquire().await?;
                    sink.lock().push(event.id.value());
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );

        for _ in 0..3 {
            stream
                .append(EventDraft::action(Action::cmd("true")), EventSource::Agent)
                .await?;
        }
        assert!(stream.unsubscribe(id));
        assert!(!stream.unsubscribe(id));
        stream
            .append(EventDraft::action(Action::cmd("after")), EventSource::Agent)
            .await?;
        gate.add_permits(10);

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn tampered_page_halts_the_stream() -> Result<()> {
        let (stream, store) = memory_stream(StreamConfig {
            page_size: 2,
            cache_pages: 0,
        })
        .await?;
        for _ in 0..5 {
            stream
                .append(EventDraft::action(Action::cmd("true")), EventSource::Agent)
                .await?;
        }

        let session_id = stream.session_id().clone();
        let mut page = store.read_page(&session_id, 0).await?.expect("page 0");
        page.events[1] = page.events[0].clone();
        store.write_page(&page).await?;

        assert!(matches!(
            stream.get(EventId(1)).await,
            Err(StreamError::Integrity(_))
        ));
        assert!(stream.is_halted());
        assert!(matches!(
            stream
                .append(EventDraft::action(Action::cmd("more")), EventSource::Agent)
                .await,
            Err(StreamError::Halted(_))
        ));
        Ok(())
    }

    struct BrokenStore;

    #[async_trait]
    impl PageStore for BrokenStore {
        async fn write_page(&self, _page: &EventPage) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn read_page(&self, _session_id: &SessionId, _index: u64) -> Result<Option<EventPage>> {
            Ok(None)
        }

        async fn page_indices(&self, _session_id: &SessionId) -> Result<Vec<u64>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_write_appends_nothing_and_halts() -> Result<()> {
        let stream = EventStream::open(
            SessionId::from_string("broken"),
            Arc::new(BrokenStore),
            StreamConfig::default(),
        )
        .await?;
        let first = stream
            .append(EventDraft::action(Action::cmd("ls")), EventSource::Agent)
            .await;
        assert!(matches!(first, Err(StreamError::Storage(_))));
        assert_eq!(stream.latest_id(), None);
        assert!(matches!(
            stream
                .append(EventDraft::action(Action::cmd("ls")), EventSource::Agent)
                .await,
            Err(StreamError::Halted(_))
        ));
        Ok(())
    }
}
