//! Paged durable storage for event logs.
//!
//! A page holds a fixed number of consecutive events and is keyed by session
//! id and page index. The stream rewrites the open page on every append, so a
//! page on disk is always a prefix-closed slice of the log.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stagehand_protocol::{Event, SessionId};
use tokio::fs;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub session_id: SessionId,
    pub index: u64,
    pub events: Vec<Event>,
    pub checksum: String,
}

impl EventPage {
    pub fn seal(session_id: SessionId, index: u64, events: Vec<Event>) -> Result<Self> {
        let checksum = checksum_events(&events)?;
        Ok(Self {
            session_id,
            index,
            events,
            checksum,
        })
    }

    /// Check the checksum and that ids are contiguous from the page's first slot.
    pub fn verify(&self, page_size: usize) -> std::result::Result<(), String> {
        let expected = checksum_events(&self.events).map_err(|e| e.to_string())?;
        if expected != self.checksum {
            return Err(format!("checksum mismatch on page {}", self.index));
        }
        if self.events.len() > page_size {
            return Err(format!(
                "page {} holds {} events, page size is {page_size}",
                self.index,
                self.events.len()
            ));
        }
        let first = self.index * page_size as u64;
        for (offset, event) in self.events.iter().enumerate() {
            let expected_id = first + offset as u64;
            if event.id.value() != expected_id {
                return Err(format!(
                    "page {} out of order: expected id {expected_id}, found {}",
                    self.index, event.id
                ));
            }
        }
        Ok(())
    }
}

fn checksum_events(events: &[Event]) -> Result<String> {
    let payload = serde_json::to_vec(events).context("failed serializing page events")?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

#[async_trait]
pub trait PageStore: Send + Sync {
    async fn write_page(&self, page: &EventPage) -> Result<()>;
    async fn read_page(&self, session_id: &SessionId, index: u64) -> Result<Option<EventPage>>;
    /// Stored page indices for a session, ascending.
    async fn page_indices(&self, session_id: &SessionId) -> Result<Vec<u64>>;

    /// Drop per-session bookkeeping once the session's stream is closed.
    /// Stored pages are kept.
    fn release(&self, _session_id: &SessionId) {}
}

/// One JSON file per page under `<root>/sessions/<session>/events/`.
#[derive(Debug)]
pub struct FilePageStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilePageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn events_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("sessions")
            .join(session_id.slug())
            .join("events")
    }

    fn page_path(&self, session_id: &SessionId, index: u64) -> PathBuf {
        self.events_dir(session_id)
            .join(format!("page-{index:08}.json"))
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn parse_index(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_str()?
            .strip_prefix("page-")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }
}

#[async_trait]
impl PageStore for FilePageStore {
    #[instrument(
        skip(self, page),
        fields(session_id = %page.session_id, page = page.index, events = page.events.len())
    )]
    async fn write_page(&self, page: &EventPage) -> Result<()> {
        let dir = self.events_dir(&page.session_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create events dir {dir:?}"))?;

        let lock = self.lock_for(&page.session_id);
        let _guard = lock.lock().await;

        let path = self.page_path(&page.session_id, page.index);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(page).context("failed serializing event page")?;
        fs::write(&tmp, payload)
            .await
            .with_context(|| format!("failed writing event page {tmp:?}"))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed committing event page {path:?}"))?;
        debug!("event page persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn read_page(&self, session_id: &SessionId, index: u64) -> Result<Option<EventPage>> {
        let path = self.page_path(session_id, index);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let payload = fs::read(&path)
            .await
            .with_context(|| format!("failed reading event page {path:?}"))?;
        let page: EventPage = serde_json::from_slice(&payload)
            .with_context(|| format!("failed parsing event page {path:?}"))?;
        if page.session_id != *session_id {
            bail!(
                "event page {path:?} belongs to session {}, not {session_id}",
                page.session_id
            );
        }
        Ok(Some(page))
    }

    fn release(&self, session_id: &SessionId) {
        self.write_locks.lock().remove(session_id);
    }

    async fn page_indices(&self, session_id: &SessionId) -> Result<Vec<u64>> {
        let dir = self.events_dir(session_id);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed listing {dir:?}"))?;
        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(index) = Self::parse_index(&entry.path()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}

/// Page store kept entirely in memory, for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPageStore {
    pages: Arc<Mutex<HashMap<SessionId, BTreeMap<u64, EventPage>>>>,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages stored for a session.
    pub fn page_count(&self, session_id: &SessionId) -> usize {
        self.pages
            .lock()
            .get(session_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl PageStore for InMemoryPageStore {
    async fn write_page(&self, page: &EventPage) -> Result<()> {
        self.pages
            .lock()
            .entry(page.session_id.clone())
            .or_default()
            .insert(page.index, page.clone());
        Ok(())
    }

    async fn read_page(&self, session_id: &SessionId, index: u64) -> Result<Option<EventPage>> {
        Ok(self
            .pages
            .lock()
            .get(session_id)
            .and_then(|pages| pages.get(&index))
            .cloned())
    }

    async fn page_indices(&self, session_id: &SessionId) -> Result<Vec<u64>> {
        Ok(self
            .pages
            .lock()
            .get(session_id)
            .map(|pages| pages.keys().copied().collect())
            .unwrap_or_default())
    }
}
