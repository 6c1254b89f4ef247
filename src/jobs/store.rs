//! # In-memory work store with asynchronous durable writes.
//!
//! [`WorkStore`] is the authoritative set of scheduled [`WorkRecord`]s, keyed
//! by [`JobKey`]. Memory is always current; persisted records are mirrored to
//! a single JSON file by a background writer.
//!
//! ## Architecture
//! ```text
//! add/remove/clear ──► RwLock<HashMap<JobKey, WorkRecord>>
//!        │
//!        └─► dirty += 1, wake.notify_one()
//!                           │
//!                           ▼
//!                   writer task (one per store)
//!                     ├─ snapshot persisted records (read lock)
//!                     ├─ encode at clock "now"
//!                     ├─ spawn_blocking(atomic_write_json)
//!                     └─ status = { generation, result }  ──► flush()
//! ```
//!
//! ## Rules
//! - Mutations never wait on I/O; bursts coalesce into one write.
//! - A failed write is logged and published as `PersistFailed`; the next
//!   mutation or flush retries with a fresh snapshot.
//! - `flush` waits for a write that started after the call, so it observes
//!   every mutation issued before it.
//! - Memory wins over disk: a reload only fills keys absent from memory, and
//!   a key removed since the last successful write stays removed.
//! - The writer holds only a `Weak` to the store state; dropping the store
//!   stops it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::ClockRef;
use crate::error::StoreError;
use crate::events::{Bus, Event, EventKind};
use crate::jobs::codec::{self, RawJobsDocument};
use crate::jobs::record::{JobKey, WorkRecord};
use crate::persist::{atomic_write_json, bounded_read_json};

/// Result of the latest write attempt, tagged with the dirty generation it covered.
#[derive(Debug, Clone)]
struct WriteStatus {
    generation: u64,
    result: Result<(), Arc<str>>,
}

/// Live records plus the keys removed since the last successful write,
/// tagged with the dirty generation of their removal.
#[derive(Default)]
struct JobTable {
    records: HashMap<JobKey, WorkRecord>,
    removed: HashMap<JobKey, u64>,
}

struct Inner {
    jobs: RwLock<JobTable>,
    path: PathBuf,
    max_file_size: u64,
    clock: ClockRef,
    bus: Bus,
    dirty: AtomicU64,
    wake: Arc<Notify>,
}

/// Authoritative set of scheduled work, mirrored to disk.
pub struct WorkStore {
    inner: Arc<Inner>,
    written: watch::Receiver<WriteStatus>,
    token: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WorkStore {
    /// Creates an empty store backed by `path` and spawns its writer.
    ///
    /// Nothing is read from disk; see [`WorkStore::open`]. Must be called
    /// inside a tokio runtime.
    pub fn new(path: impl Into<PathBuf>, max_file_size: u64, clock: ClockRef, bus: Bus) -> Self {
        let inner = Arc::new(Inner {
            jobs: RwLock::new(JobTable::default()),
            path: path.into(),
            max_file_size,
            clock,
            bus,
            dirty: AtomicU64::new(0),
            wake: Arc::new(Notify::new()),
        });
        let (tx, rx) = watch::channel(WriteStatus {
            generation: 0,
            result: Ok(()),
        });
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_writer(
            Arc::downgrade(&inner),
            Arc::clone(&inner.wake),
            token.clone(),
            tx,
        ));

        Self {
            inner,
            written: rx,
            token,
            writer: Mutex::new(Some(handle)),
        }
    }

    /// Creates the store and loads every persisted record from `path`.
    pub async fn open(
        path: impl Into<PathBuf>,
        max_file_size: u64,
        clock: ClockRef,
        bus: Bus,
    ) -> Self {
        let store = Self::new(path, max_file_size, clock, bus);
        let loaded = store.read_all_from_disk().await;
        info!(path = %store.path().display(), count = loaded.len(), "Work store opened");
        store
    }

    /// File the store mirrors to.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Clock the store converts run times with.
    pub fn clock(&self) -> &ClockRef {
        &self.inner.clock
    }

    /// Inserts or replaces a record by key.
    ///
    /// Returns `true` if an existing record was replaced. A durable write is
    /// scheduled when either the new or the replaced record is persisted.
    pub async fn add(&self, record: WorkRecord) -> bool {
        let key = record.key();
        let persisted = record.is_persisted();
        let replaced = {
            let mut table = self.inner.jobs.write().await;
            table.removed.remove(&key);
            let replaced = table.records.insert(key, record);
            if persisted || replaced.as_ref().is_some_and(WorkRecord::is_persisted) {
                self.inner.mark_dirty();
            }
            replaced
        };
        debug!(job_id = key.job_id, uid = key.uid, replaced = replaced.is_some(), "Job added");
        self.inner
            .bus
            .publish(Event::new(EventKind::JobAdded).with_job(key.job_id, key.uid));
        replaced.is_some()
    }

    /// Removes a record by key. Idempotent; returns whether it was present.
    pub async fn remove(&self, key: JobKey) -> bool {
        {
            let mut table = self.inner.jobs.write().await;
            if table.records.remove(&key).is_none() {
                return false;
            }
            // Disk may still hold an older persisted copy under this key.
            let generation = self.inner.mark_dirty();
            table.removed.insert(key, generation);
        }
        debug!(job_id = key.job_id, uid = key.uid, "Job removed");
        self.inner
            .bus
            .publish(Event::new(EventKind::JobRemoved).with_job(key.job_id, key.uid));
        true
    }

    /// Containment by key (job id + owning uid).
    pub async fn contains_job(&self, record: &WorkRecord) -> bool {
        self.inner.jobs.read().await.records.contains_key(&record.key())
    }

    pub async fn contains_job_id_for_uid(&self, job_id: i32, uid: u32) -> bool {
        self.inner
            .jobs
            .read()
            .await
            .records
            .contains_key(&JobKey { uid, job_id })
    }

    pub async fn get(&self, uid: u32, job_id: i32) -> Option<WorkRecord> {
        self.inner
            .jobs
            .read()
            .await
            .records
            .get(&JobKey { uid, job_id })
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.jobs.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.jobs.read().await.records.is_empty()
    }

    /// All records, ordered by key.
    pub async fn jobs(&self) -> Vec<WorkRecord> {
        self.collect(|_| true).await
    }

    /// Records owned by `uid`, ordered by job id.
    pub async fn jobs_by_uid(&self, uid: u32) -> Vec<WorkRecord> {
        self.collect(|r| r.uid() == uid).await
    }

    /// Records owned by any uid of `user_id`.
    pub async fn jobs_by_user(&self, user_id: u32) -> Vec<WorkRecord> {
        self.collect(|r| r.user_id() == user_id).await
    }

    /// Records whose earliest bound has been reached at `now_elapsed`.
    pub async fn ready_jobs(&self, now_elapsed: u64) -> Vec<WorkRecord> {
        self.collect(|r| r.is_ready(now_elapsed)).await
    }

    async fn collect(&self, keep: impl Fn(&WorkRecord) -> bool) -> Vec<WorkRecord> {
        let mut out: Vec<WorkRecord> = self
            .inner
            .jobs
            .read()
            .await
            .records
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        out.sort_by_key(WorkRecord::key);
        out
    }

    /// Erases every record and schedules the write of the empty set.
    pub async fn clear(&self) {
        let mut table = self.inner.jobs.write().await;
        let generation = self.inner.mark_dirty();
        let JobTable { records, removed } = &mut *table;
        for (key, _) in records.drain() {
            removed.insert(key, generation);
        }
        drop(table);
        debug!("Work store cleared");
    }

    /// Loads every persisted record, merges it into memory and returns it.
    ///
    /// Only keys absent from memory are filled in; a record that was replaced
    /// or removed since the last successful write keeps its in-memory state.
    /// The table stays locked for the whole read so the writer cannot swap
    /// the file underneath.
    ///
    /// A missing file is an empty set. An unreadable file or an unsupported
    /// version is logged and yields an empty set. Bad records are skipped
    /// with `JobSkipped`; clamped periodic windows publish `JobClamped`.
    pub async fn read_all_from_disk(&self) -> Vec<WorkRecord> {
        let mut table = self.inner.jobs.write().await;
        let path = self.inner.path.clone();
        let max = self.inner.max_file_size;
        let read = tokio::task::spawn_blocking(move || {
            bounded_read_json::<RawJobsDocument>(&path, max)
        })
        .await;

        let doc = match read {
            Ok(Ok(doc)) => doc,
            Ok(Err(e)) if e.is_not_found() => {
                debug!(path = %self.path().display(), "No persisted jobs");
                return Vec::new();
            }
            Ok(Err(e)) => {
                warn!(path = %self.path().display(), error = %e, "Ignoring unreadable jobs file");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Jobs file read task failed");
                return Vec::new();
            }
        };

        let decoded = match codec::decode(doc, self.inner.clock.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(path = %self.path().display(), error = %e, "Ignoring jobs file");
                return Vec::new();
            }
        };

        for skipped in &decoded.skipped {
            warn!(
                job_id = ?skipped.job_id,
                uid = ?skipped.uid,
                reason = %skipped.reason,
                "Skipping malformed persisted job"
            );
            let mut ev = Event::new(EventKind::JobSkipped).with_reason(skipped.reason.as_str());
            if let (Some(job_id), Some(uid)) = (skipped.job_id, skipped.uid) {
                ev = ev.with_job(job_id, uid);
            }
            self.inner.bus.publish(ev);
        }
        for clamped in &decoded.clamped {
            warn!(
                job_id = clamped.key.job_id,
                uid = clamped.key.uid,
                latest_before = clamped.latest_before,
                latest_after = clamped.latest_after,
                "Periodic job window too far in the future; clamping"
            );
            self.inner.bus.publish(
                Event::new(EventKind::JobClamped).with_job(clamped.key.job_id, clamped.key.uid),
            );
        }

        for rec in &decoded.records {
            let key = rec.key();
            if table.records.contains_key(&key) || table.removed.contains_key(&key) {
                continue;
            }
            table.records.insert(key, rec.clone());
        }
        drop(table);
        self.inner
            .bus
            .publish(Event::new(EventKind::JobsLoaded).with_count(decoded.records.len()));
        decoded.records
    }

    /// Waits until the writer has attempted every mutation issued before this
    /// call and returns the outcome of that attempt.
    ///
    /// # Errors
    /// [`StoreError::WriteFailed`] if the attempt failed, [`StoreError::Closed`]
    /// if the store was shut down.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut rx = self.written.clone();
        let target = self.inner.mark_dirty();
        loop {
            {
                let status = rx.borrow_and_update();
                if status.generation >= target {
                    return status
                        .result
                        .clone()
                        .map_err(|msg| StoreError::WriteFailed(msg.to_string()));
                }
            }
            if rx.changed().await.is_err() {
                return Err(StoreError::Closed);
            }
        }
    }

    /// Stops the writer after a final write of any pending changes.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Work store writer ended abnormally");
            }
        }
    }
}

impl Drop for WorkStore {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Inner {
    /// Bumps the dirty generation and wakes the writer; returns the new generation.
    fn mark_dirty(&self) -> u64 {
        let generation = self.dirty.fetch_add(1, Ordering::AcqRel) + 1;
        self.wake.notify_one();
        generation
    }

    /// Writes the persisted records; `generation` is the dirty count the
    /// snapshot covers.
    async fn write_snapshot(&self, generation: u64) -> Result<(), Arc<str>> {
        let mut records: Vec<WorkRecord> = self
            .jobs
            .read()
            .await
            .records
            .values()
            .filter(|r| r.is_persisted())
            .cloned()
            .collect();
        records.sort_by_key(WorkRecord::key);

        let doc = codec::encode(&records, self.clock.as_ref());
        let count = doc.len();
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || atomic_write_json(&path, &doc)).await;

        let err = match written {
            Ok(Ok(())) => {
                debug!(path = %self.path.display(), count, "Persisted jobs");
                self.jobs
                    .write()
                    .await
                    .removed
                    .retain(|_, removed_at| *removed_at > generation);
                self.bus
                    .publish(Event::new(EventKind::JobsPersisted).with_count(count));
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("write task failed: {e}"),
        };
        warn!(path = %self.path.display(), error = %err, "Failed to persist jobs; will retry");
        self.bus
            .publish(Event::new(EventKind::PersistFailed).with_reason(err.as_str()));
        Err(Arc::from(err))
    }
}

async fn run_writer(
    inner: Weak<Inner>,
    wake: Arc<Notify>,
    token: CancellationToken,
    status: watch::Sender<WriteStatus>,
) {
    let mut attempted = 0u64;
    loop {
        if let Some(inner) = inner.upgrade() {
            let target = inner.dirty.load(Ordering::Acquire);
            if target > attempted {
                let result = inner.write_snapshot(target).await;
                attempted = target;
                status.send_replace(WriteStatus {
                    generation: target,
                    result,
                });
                continue;
            }
        } else {
            return;
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = token.cancelled() => break,
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let target = inner.dirty.load(Ordering::Acquire);
    if target > attempted {
        let result = inner.write_snapshot(target).await;
        status.send_replace(WriteStatus {
            generation: target,
            result,
        });
    }
}
