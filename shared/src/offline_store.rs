use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::queue::{OperationError, OperationOptions, OperationQueue, Priority, QueueError};
use crate::storage::{
    KeyNamespace, KeyValueStore, StorageError, StorageKey, WriteOp, MAX_VALUE_BYTES,
};
use crate::{UnixTimeMs, MAX_MEDIA_RETRIES, MAX_PAYLOAD_BYTES, MAX_PENDING_MEDIA, UPLOAD_TIMEOUT_MS};

const MAX_REFERENCE_LENGTH: usize = 256;

// ============================================================================
// Identifiers and payloads
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaId(String);

impl MediaId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, MediaStoreError> {
        let id = id.into();
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(MediaStoreError::InvalidInput(format!(
                "media id must be 1..={} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MediaStoreError::InvalidInput(format!(
                "media id contains invalid characters: {id}"
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MediaId {
    type Error = MediaStoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MediaId> for String {
    fn from(id: MediaId) -> Self {
        id.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Captured evidence bytes as handed over by the shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaPayload {
    pub bytes: Bytes,
    pub content_type: String,
}

impl MediaPayload {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> String {
        hex::encode(blake3::hash(&self.bytes).as_bytes())
    }
}

/// Persisted bookkeeping for one captured item. The payload itself lives
/// under its own blob key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMedia {
    pub id: MediaId,
    pub checklist_item_id: String,
    pub inspection_id: String,
    pub timestamp: UnixTimeMs,
    pub uploaded: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content_hash: String,
}

impl PendingMedia {
    #[must_use]
    pub fn is_sync_eligible(&self, max_retries: u32) -> bool {
        !self.uploaded && self.retry_count < max_retries
    }

    #[must_use]
    pub fn has_failed(&self, max_retries: u32) -> bool {
        !self.uploaded && self.retry_count >= max_retries
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStats {
    pub pending_count: usize,
    pub failed_count: usize,
    pub total_pending_bytes: u64,
}

/// Outcome of one sync pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub persist_error: Option<String>,
    pub attempted_ids: Vec<MediaId>,
}

impl SyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.persist_error.is_none()
    }

    /// Fold a follow-up pass into this report.
    pub fn absorb(&mut self, other: SyncReport) {
        self.attempted += other.attempted;
        self.uploaded += other.uploaded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        if other.persist_error.is_some() {
            self.persist_error = other.persist_error;
        }
        self.attempted_ids.extend(other.attempted_ids);
    }
}

/// Backend call that delivers one payload. Errors decide retry behaviour,
/// see [`OperationError`].
#[async_trait]
pub trait MediaUploader: Send + Sync + 'static {
    async fn upload(
        &self,
        media: &PendingMedia,
        payload: MediaPayload,
        cancel: CancellationToken,
    ) -> Result<(), OperationError>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaStoreConfig {
    /// Key inside the `media` namespace holding the metadata array
    pub metadata_key: String,
    pub max_retries: u32,
    pub max_entries: usize,
    pub max_payload_bytes: usize,
    pub upload_timeout_ms: u64,
    pub upload_priority: Priority,
    /// Queue-level retries per upload attempt within one pass
    pub upload_retries: u32,
}

impl Default for MediaStoreConfig {
    fn default() -> Self {
        Self {
            metadata_key: "pending".to_string(),
            max_retries: MAX_MEDIA_RETRIES,
            max_entries: MAX_PENDING_MEDIA,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            upload_timeout_ms: UPLOAD_TIMEOUT_MS,
            upload_priority: Priority::Normal,
            upload_retries: 0,
        }
    }
}

impl MediaStoreConfig {
    pub fn validate(&self) -> Result<(), MediaStoreError> {
        StorageKey::new(KeyNamespace::Media, self.metadata_key.clone())?;
        if self.max_retries == 0 {
            return Err(MediaStoreError::InvalidConfig(
                "max_retries must be > 0".into(),
            ));
        }
        if self.max_entries == 0 {
            return Err(MediaStoreError::InvalidConfig(
                "max_entries must be > 0".into(),
            ));
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_VALUE_BYTES {
            return Err(MediaStoreError::InvalidConfig(format!(
                "max_payload_bytes must be in 1..={MAX_VALUE_BYTES}"
            )));
        }
        if self.upload_timeout_ms == 0 {
            return Err(MediaStoreError::InvalidConfig(
                "upload_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid media store configuration: {0}")]
    InvalidConfig(String),

    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("media store full: {max} entries awaiting upload")]
    Full { max: usize },

    #[error("media not found: {0}")]
    NotFound(MediaId),

    /// The item is kept in memory for this session and re-persisted on the next sync pass.
    #[error("failed to persist media {id}: {source}")]
    PersistFailed {
        id: MediaId,
        #[source]
        source: StorageError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct MediaState {
    entries: Vec<PendingMedia>,
    /// Payloads whose blob write has not landed yet
    cached_payloads: HashMap<MediaId, MediaPayload>,
    unpersisted: HashSet<MediaId>,
    uploading: HashSet<MediaId>,
}

impl MediaState {
    fn find_mut(&mut self, id: &MediaId) -> Option<&mut PendingMedia> {
        self.entries.iter_mut().find(|m| &m.id == id)
    }

    fn remove_uploaded(&mut self) -> Vec<MediaId> {
        let mut removed = Vec::new();
        self.entries.retain(|m| {
            if m.uploaded {
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.unpersisted.remove(id);
            self.cached_payloads.remove(id);
        }
        removed
    }
}

/// Removes the in-flight marks of a sync pass even if the pass future is dropped.
struct UploadingMarks<'a> {
    state: &'a Mutex<MediaState>,
    ids: Vec<MediaId>,
}

impl Drop for UploadingMarks<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for id in &self.ids {
            state.uploading.remove(id);
        }
    }
}

fn blob_key(id: &MediaId) -> Result<StorageKey, StorageError> {
    StorageKey::new(KeyNamespace::MediaBlob, id.as_str())
}

/// Durable record of captured-but-not-yet-uploaded evidence.
pub struct OfflineMediaStore {
    storage: Arc<dyn KeyValueStore>,
    queue: Arc<OperationQueue>,
    uploader: Arc<dyn MediaUploader>,
    config: MediaStoreConfig,
    metadata_key: StorageKey,
    state: Mutex<MediaState>,
}

impl OfflineMediaStore {
    /// Load persisted metadata. Malformed elements are logged and skipped;
    /// an unreadable document is moved aside and the store starts empty.
    #[instrument(skip_all, fields(metadata_key = %config.metadata_key))]
    pub fn open(
        storage: Arc<dyn KeyValueStore>,
        queue: Arc<OperationQueue>,
        uploader: Arc<dyn MediaUploader>,
        config: MediaStoreConfig,
    ) -> Result<Self, MediaStoreError> {
        config.validate()?;
        let metadata_key = StorageKey::new(KeyNamespace::Media, config.metadata_key.clone())?;
        let entries = load_entries(storage.as_ref(), &metadata_key)?;

        info!(entries = entries.len(), "Offline media store opened");
        Ok(Self {
            storage,
            queue,
            uploader,
            config,
            metadata_key,
            state: Mutex::new(MediaState {
                entries,
                ..MediaState::default()
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MediaStoreConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Persist a captured item and return its id. Works offline; uploading
    /// is left to [`sync`](Self::sync).
    #[instrument(skip(self, payload), fields(size = payload.bytes.len()))]
    pub fn save(
        &self,
        payload: MediaPayload,
        checklist_item_id: &str,
        inspection_id: &str,
    ) -> Result<MediaId, MediaStoreError> {
        validate_reference("checklist_item_id", checklist_item_id)?;
        validate_reference("inspection_id", inspection_id)?;
        if payload.bytes.is_empty() {
            return Err(MediaStoreError::InvalidInput("payload is empty".into()));
        }
        if payload.bytes.len() > self.config.max_payload_bytes {
            return Err(MediaStoreError::PayloadTooLarge {
                size: payload.bytes.len(),
                max: self.config.max_payload_bytes,
            });
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // A rejected save leaves memory and storage untouched
        let awaiting = state.entries.iter().filter(|m| !m.uploaded).count();
        if awaiting >= self.config.max_entries {
            return Err(MediaStoreError::Full {
                max: self.config.max_entries,
            });
        }

        let mut batch = Vec::new();
        if state.entries.len() >= self.config.max_entries {
            let evicted = state.remove_uploaded();
            debug!(evicted = evicted.len(), "Evicted uploaded entries to make room");
            for id in &evicted {
                batch.push(WriteOp::delete(blob_key(id)?));
            }
        }

        let id = MediaId::generate();
        let entry = PendingMedia {
            id: id.clone(),
            checklist_item_id: checklist_item_id.to_string(),
            inspection_id: inspection_id.to_string(),
            timestamp: UnixTimeMs::now(),
            uploaded: false,
            retry_count: 0,
            last_error: None,
            size_bytes: payload.bytes.len() as u64,
            content_type: payload.content_type.clone(),
            content_hash: payload.content_hash(),
        };
        state.entries.push(entry);
        batch.push(WriteOp::put(blob_key(&id)?, payload.bytes.clone()));

        match self.persist_locked(state, batch) {
            Ok(()) => {
                info!(media_id = %id, inspection_id, "Media captured");
                Ok(id)
            }
            Err(source) => {
                error!(media_id = %id, "Failed to persist captured media: {source}");
                state.unpersisted.insert(id.clone());
                state.cached_payloads.insert(id.clone(), payload);
                Err(MediaStoreError::PersistFailed { id, source })
            }
        }
    }

    /// Upload every eligible entry through the operation queue.
    pub async fn sync(&self) -> SyncReport {
        self.sync_where(|_| true).await
    }

    /// Like [`sync`](Self::sync), restricted to eligible entries accepted by `filter`.
    #[instrument(skip_all)]
    pub async fn sync_where<F>(&self, filter: F) -> SyncReport
    where
        F: Fn(&PendingMedia) -> bool + Send,
    {
        let mut report = SyncReport::default();

        let (candidates, _marks) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Err(err) = self.repersist_locked(state) {
                warn!("Could not re-persist media saved while storage was failing: {err}");
            }

            let candidates: Vec<(PendingMedia, Option<MediaPayload>)> = state
                .entries
                .iter()
                .filter(|m| {
                    m.is_sync_eligible(self.config.max_retries)
                        && !state.uploading.contains(&m.id)
                        && filter(*m)
                })
                .map(|m| (m.clone(), state.cached_payloads.get(&m.id).cloned()))
                .collect();
            for (media, _) in &candidates {
                state.uploading.insert(media.id.clone());
            }
            let marks = UploadingMarks {
                state: &self.state,
                ids: candidates.iter().map(|(m, _)| m.id.clone()).collect(),
            };
            (candidates, marks)
        };

        if candidates.is_empty() {
            debug!("No media awaiting upload");
            return report;
        }
        report.attempted = candidates.len();
        report.attempted_ids = candidates.iter().map(|(m, _)| m.id.clone()).collect();
        info!(count = candidates.len(), "Starting media upload pass");

        let uploads: Vec<BoxFuture<'static, (MediaId, Result<(), QueueError>)>> = candidates
            .into_iter()
            .map(|(media, cached)| {
                let id = media.id.clone();
                match self.submit(media, cached) {
                    Ok(handle) => async move { (id, handle.await) }.boxed(),
                    Err(err) => future::ready((id, Err(err))).boxed(),
                }
            })
            .collect();

        let outcomes = future::join_all(uploads).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut batch = Vec::new();
        for (id, outcome) in outcomes {
            state.uploading.remove(&id);
            let max_retries = self.config.max_retries;
            let Some(entry) = state.entries.iter_mut().find(|m| m.id == id) else {
                continue;
            };

            match outcome {
                Ok(()) => {
                    entry.uploaded = true;
                    entry.last_error = None;
                    report.uploaded += 1;
                    state.cached_payloads.remove(&id);
                    state.unpersisted.remove(&id);
                    match blob_key(&id) {
                        Ok(key) => batch.push(WriteOp::delete(key)),
                        Err(err) => warn!(media_id = %id, "Invalid blob key: {err}"),
                    }
                    debug!(media_id = %id, "Media uploaded");
                }
                Err(err) if err.is_cancelled() => {
                    report.skipped += 1;
                    debug!(media_id = %id, "Upload cancelled, entry left pending");
                }
                Err(err) => {
                    let permanent = matches!(
                        err,
                        QueueError::Operation(OperationError::Permanent(_)) | QueueError::Panicked
                    );
                    entry.retry_count = if permanent {
                        max_retries
                    } else {
                        entry.retry_count.saturating_add(1).min(max_retries)
                    };
                    entry.last_error = Some(err.to_string());
                    report.failed += 1;
                    warn!(
                        media_id = %id,
                        retry_count = entry.retry_count,
                        permanent,
                        "Media upload failed: {err}"
                    );
                }
            }
        }

        if let Err(err) = self.persist_locked(state, batch) {
            error!("Failed to persist sync results: {err}");
            report.persist_error = Some(err.to_string());
        }

        info!(
            attempted = report.attempted,
            uploaded = report.uploaded,
            failed = report.failed,
            skipped = report.skipped,
            "Media upload pass finished"
        );
        report
    }

    /// Drop uploaded entries from durable storage. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn cleanup(&self) -> Result<usize, MediaStoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let removed = state.remove_uploaded();
        let mut batch = Vec::with_capacity(removed.len());
        for id in &removed {
            batch.push(WriteOp::delete(blob_key(id)?));
        }
        self.persist_locked(state, batch)?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "Cleaned up uploaded media");
        }
        Ok(removed.len())
    }

    /// Manual retry path: make a failed entry eligible for sync again.
    /// Returns false if the entry was already uploaded.
    #[instrument(skip(self))]
    pub fn retry(&self, id: &MediaId) -> Result<bool, MediaStoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .find_mut(id)
            .ok_or_else(|| MediaStoreError::NotFound(id.clone()))?;
        if entry.uploaded {
            return Ok(false);
        }
        entry.retry_count = 0;
        entry.last_error = None;
        self.persist_locked(state, Vec::new())?;
        info!(media_id = %id, "Media queued for manual retry");
        Ok(true)
    }

    #[must_use]
    pub fn get(&self, id: &MediaId) -> Option<PendingMedia> {
        self.state.lock().entries.iter().find(|m| &m.id == id).cloned()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<PendingMedia> {
        self.state.lock().entries.clone()
    }

    #[must_use]
    pub fn get_stats(&self) -> MediaStats {
        let state = self.state.lock();
        let max_retries = self.config.max_retries;
        state
            .entries
            .iter()
            .fold(MediaStats::default(), |mut stats, media| {
                if media.is_sync_eligible(max_retries) {
                    stats.pending_count += 1;
                } else if media.has_failed(max_retries) {
                    stats.failed_count += 1;
                }
                if !media.uploaded {
                    stats.total_pending_bytes += media.size_bytes;
                }
                stats
            })
    }

    /// True if any entry has not reached durable storage.
    #[must_use]
    pub fn has_unpersisted(&self) -> bool {
        !self.state.lock().unpersisted.is_empty()
    }

    /// The blob is read inside the attempt, so only running uploads hold a
    /// payload in memory. `cached` covers entries whose blob never landed.
    fn submit(
        &self,
        media: PendingMedia,
        cached: Option<MediaPayload>,
    ) -> Result<crate::queue::OperationHandle<()>, QueueError> {
        let options = OperationOptions::new()
            .with_priority(self.config.upload_priority)
            .with_timeout(Duration::from_millis(self.config.upload_timeout_ms))
            .with_max_retries(self.config.upload_retries)
            .with_entity(media.inspection_id.clone())
            .with_metadata("mediaId", media.id.as_str())
            .with_metadata("checklistItemId", media.checklist_item_id.clone());

        let uploader = Arc::clone(&self.uploader);
        let storage = Arc::clone(&self.storage);
        let media = Arc::new(media);
        self.queue.add(
            move |cancel: CancellationToken| {
                let uploader = Arc::clone(&uploader);
                let storage = Arc::clone(&storage);
                let media = Arc::clone(&media);
                let cached = cached.clone();
                async move {
                    let payload = match cached {
                        Some(payload) => payload,
                        None => load_payload(storage.as_ref(), &media)?,
                    };
                    uploader.upload(&media, payload, cancel).await
                }
            },
            options,
        )
    }

    fn metadata_op(&self, state: &MediaState) -> Result<WriteOp, StorageError> {
        let persisted: Vec<&PendingMedia> = state
            .entries
            .iter()
            .filter(|m| !state.unpersisted.contains(&m.id))
            .collect();
        Ok(WriteOp::put(
            self.metadata_key.clone(),
            serde_json::to_vec(&persisted)?,
        ))
    }

    /// Write `batch` plus the metadata document. Under storage pressure, drop
    /// uploaded entries and try once more.
    fn persist_locked(
        &self,
        state: &mut MediaState,
        mut batch: Vec<WriteOp>,
    ) -> Result<(), StorageError> {
        let mut attempt = batch.clone();
        attempt.push(self.metadata_op(state)?);
        match self.storage.apply(&attempt) {
            Ok(()) => Ok(()),
            Err(err) if err.is_storage_pressure() => {
                warn!("Storage pressure, cleaning up uploaded media before retrying: {err}");
                for id in state.remove_uploaded() {
                    batch.push(WriteOp::delete(blob_key(&id)?));
                }
                batch.push(self.metadata_op(state)?);
                self.storage.apply(&batch)
            }
            Err(err) => Err(err),
        }
    }

    fn repersist_locked(&self, state: &mut MediaState) -> Result<(), StorageError> {
        if state.unpersisted.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut state.unpersisted);
        let mut batch = Vec::with_capacity(pending.len());
        for id in &pending {
            if let Some(payload) = state.cached_payloads.get(id) {
                batch.push(WriteOp::put(blob_key(id)?, payload.bytes.clone()));
            }
        }

        match self.persist_locked(state, batch) {
            Ok(()) => {
                for id in &pending {
                    state.cached_payloads.remove(id);
                }
                info!(count = pending.len(), "Re-persisted media captured during storage failure");
                Ok(())
            }
            Err(err) => {
                state.unpersisted = pending;
                Err(err)
            }
        }
    }
}

/// Read and verify a stored payload. Missing or corrupt bytes never heal on
/// retry, so both are permanent.
fn load_payload(
    storage: &dyn KeyValueStore,
    media: &PendingMedia,
) -> Result<MediaPayload, OperationError> {
    let key = blob_key(&media.id).map_err(|e| OperationError::permanent(e.to_string()))?;
    let bytes = match storage.get(&key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Err(OperationError::permanent(format!(
                "payload missing for media {}",
                media.id
            )))
        }
        Err(err) => return Err(OperationError::transient(err.to_string())),
    };

    let payload = MediaPayload {
        bytes,
        content_type: media.content_type.clone(),
    };
    if !media.content_hash.is_empty() {
        let actual = payload.content_hash();
        if actual != media.content_hash {
            error!(
                media_id = %media.id,
                expected = %media.content_hash,
                actual = %actual,
                "Stored payload failed integrity check"
            );
            return Err(OperationError::permanent(format!(
                "payload integrity check failed: expected {}, got {actual}",
                media.content_hash
            )));
        }
    }
    Ok(payload)
}

fn validate_reference(field: &str, value: &str) -> Result<(), MediaStoreError> {
    if value.trim().is_empty() {
        return Err(MediaStoreError::InvalidInput(format!(
            "{field} cannot be empty"
        )));
    }
    if value.len() > MAX_REFERENCE_LENGTH {
        return Err(MediaStoreError::InvalidInput(format!(
            "{field} exceeds {MAX_REFERENCE_LENGTH} bytes"
        )));
    }
    Ok(())
}

fn load_entries(
    storage: &dyn KeyValueStore,
    metadata_key: &StorageKey,
) -> Result<Vec<PendingMedia>, MediaStoreError> {
    let Some(raw) = storage.get(metadata_key)? else {
        return Ok(Vec::new());
    };

    let elements: Vec<serde_json::Value> = match serde_json::from_slice(&raw) {
        Ok(elements) => elements,
        Err(err) => {
            error!("Media metadata unreadable, moving it aside: {err}");
            let quarantine = StorageKey::new(
                KeyNamespace::Media,
                format!(
                    "{}-quarantine-{}",
                    metadata_key.key(),
                    UnixTimeMs::now().as_millis()
                ),
            )?;
            storage.apply(&[WriteOp::put(quarantine, raw), WriteOp::delete(metadata_key.clone())])?;
            return Ok(Vec::new());
        }
    };

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(elements.len());
    for (index, element) in elements.into_iter().enumerate() {
        match serde_json::from_value::<PendingMedia>(element) {
            Ok(media) if seen.insert(media.id.clone()) => entries.push(media),
            Ok(media) => warn!(media_id = %media.id, "Skipping duplicate media entry"),
            Err(err) => warn!(index, "Quarantined malformed media entry: {err}"),
        }
    }
    Ok(entries)
}
