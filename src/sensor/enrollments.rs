//! # Durable per-user enrollment records.
//!
//! The hardware keeps the templates; this store keeps which template ids
//! belong to which user and the names users gave them. Both sides can drift
//! apart (a crash between the two writes, a factory reset of one of them);
//! the dispatcher reconciles them when enrollments are listed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::persist::{atomic_write_json, bounded_read_json};
use crate::sessions::UserId;

const FILE_VERSION: u32 = 0;

/// One enrolled template of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: i32,
    #[serde(default)]
    pub name: String,
}

/// Durable per-user enrollment records.
#[async_trait]
pub trait EnrollmentStore: Send + Sync + 'static {
    /// Records template `id` for `owner`. Idempotent.
    async fn add(&self, owner: UserId, id: i32) -> Result<(), StoreError>;

    /// Forgets template `id` of `owner`; returns whether it was recorded.
    async fn remove(&self, owner: UserId, id: i32) -> Result<bool, StoreError>;

    /// Enrollments of `owner`, ordered by id.
    async fn list(&self, owner: UserId) -> Vec<Enrollment>;

    /// Renames template `id` of `owner`; returns whether it was recorded.
    async fn set_name(&self, owner: UserId, id: i32, name: &str) -> Result<bool, StoreError>;

    /// Replaces every enrollment of `owner`.
    async fn replace(&self, owner: UserId, enrollments: Vec<Enrollment>) -> Result<(), StoreError>;
}

/// In-memory book shared by both store flavours.
#[derive(Debug, Default, Clone)]
struct Book {
    users: BTreeMap<UserId, Vec<Enrollment>>,
}

impl Book {
    fn add(&mut self, owner: UserId, id: i32) -> bool {
        let list = self.users.entry(owner).or_default();
        if list.iter().any(|e| e.id == id) {
            return false;
        }
        list.push(Enrollment {
            id,
            name: String::new(),
        });
        list.sort_by_key(|e| e.id);
        true
    }

    fn remove(&mut self, owner: UserId, id: i32) -> bool {
        let Some(list) = self.users.get_mut(&owner) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.users.remove(&owner);
        }
        removed
    }

    fn list(&self, owner: UserId) -> Vec<Enrollment> {
        self.users.get(&owner).cloned().unwrap_or_default()
    }

    fn set_name(&mut self, owner: UserId, id: i32, name: &str) -> bool {
        match self
            .users
            .get_mut(&owner)
            .and_then(|list| list.iter_mut().find(|e| e.id == id))
        {
            Some(e) if e.name != name => {
                e.name = name.to_string();
                true
            }
            _ => false,
        }
    }

    fn replace(&mut self, owner: UserId, mut enrollments: Vec<Enrollment>) {
        if enrollments.is_empty() {
            self.users.remove(&owner);
            return;
        }
        enrollments.sort_by_key(|e| e.id);
        enrollments.dedup_by_key(|e| e.id);
        self.users.insert(owner, enrollments);
    }

    fn contains(&self, owner: UserId, id: i32) -> bool {
        self.users
            .get(&owner)
            .is_some_and(|list| list.iter().any(|e| e.id == id))
    }
}

/// Volatile store, for tests and for setups without a data directory.
#[derive(Debug, Default)]
pub struct MemoryEnrollmentStore {
    book: Mutex<Book>,
}

impl MemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnrollmentStore for MemoryEnrollmentStore {
    async fn add(&self, owner: UserId, id: i32) -> Result<(), StoreError> {
        self.book.lock().await.add(owner, id);
        Ok(())
    }

    async fn remove(&self, owner: UserId, id: i32) -> Result<bool, StoreError> {
        Ok(self.book.lock().await.remove(owner, id))
    }

    async fn list(&self, owner: UserId) -> Vec<Enrollment> {
        self.book.lock().await.list(owner)
    }

    async fn set_name(&self, owner: UserId, id: i32, name: &str) -> Result<bool, StoreError> {
        let mut book = self.book.lock().await;
        let known = book.contains(owner, id);
        book.set_name(owner, id, name);
        Ok(known)
    }

    async fn replace(&self, owner: UserId, enrollments: Vec<Enrollment>) -> Result<(), StoreError> {
        self.book.lock().await.replace(owner, enrollments);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct DocumentRef<'a> {
    version: u32,
    users: &'a BTreeMap<UserId, Vec<Enrollment>>,
}

#[derive(Debug, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    users: BTreeMap<UserId, Vec<Enrollment>>,
}

/// JSON-file store written with the atomic temp-file protocol.
///
/// Every change is written before the call returns; the in-memory copy stays
/// authoritative if the write fails.
#[derive(Debug)]
pub struct FileEnrollmentStore {
    path: PathBuf,
    book: Mutex<Book>,
}

impl FileEnrollmentStore {
    /// Loads `path`; a missing file is an empty store.
    ///
    /// # Errors
    /// The file exists but cannot be read, is larger than `max_file_size`,
    /// or carries an unsupported version.
    pub async fn open(path: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, StoreError> {
        let path = path.into();
        let read_path = path.clone();
        let read = tokio::task::spawn_blocking(move || {
            bounded_read_json::<Document>(&read_path, max_file_size)
        })
        .await
        .map_err(|e| StoreError::io("enrollment read task", std::io::Error::other(e)))?;

        let book = match read {
            Ok(doc) if doc.version == FILE_VERSION => Book { users: doc.users },
            Ok(doc) => {
                return Err(StoreError::UnsupportedVersion {
                    found: doc.version,
                    expected: FILE_VERSION,
                });
            }
            Err(e) if e.is_not_found() => Book::default(),
            Err(e) => return Err(e),
        };
        debug!(path = %path.display(), users = book.users.len(), "Enrollment store opened");

        Ok(Self {
            path,
            book: Mutex::new(book),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, book: &Book) -> Result<(), StoreError> {
        let path = self.path.clone();
        let snapshot = book.users.clone();
        tokio::task::spawn_blocking(move || {
            atomic_write_json(
                &path,
                &DocumentRef {
                    version: FILE_VERSION,
                    users: &snapshot,
                },
            )
        })
        .await
        .map_err(|e| StoreError::io("enrollment write task", std::io::Error::other(e)))?
    }
}

#[async_trait]
impl EnrollmentStore for FileEnrollmentStore {
    async fn add(&self, owner: UserId, id: i32) -> Result<(), StoreError> {
        let mut book = self.book.lock().await;
        if book.add(owner, id) {
            self.persist(&book).await?;
        }
        Ok(())
    }

    async fn remove(&self, owner: UserId, id: i32) -> Result<bool, StoreError> {
        let mut book = self.book.lock().await;
        if !book.remove(owner, id) {
            return Ok(false);
        }
        self.persist(&book).await?;
        Ok(true)
    }

    async fn list(&self, owner: UserId) -> Vec<Enrollment> {
        self.book.lock().await.list(owner)
    }

    async fn set_name(&self, owner: UserId, id: i32, name: &str) -> Result<bool, StoreError> {
        let mut book = self.book.lock().await;
        if !book.contains(owner, id) {
            return Ok(false);
        }
        if book.set_name(owner, id, name) {
            self.persist(&book).await?;
        }
        Ok(true)
    }

    async fn replace(&self, owner: UserId, enrollments: Vec<Enrollment>) -> Result<(), StoreError> {
        let mut book = self.book.lock().await;
        book.replace(owner, enrollments);
        self.persist(&book).await
    }
}
