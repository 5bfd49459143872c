//! Object store seam and the adapter the pipeline talks to.
//!
//! [`ObjectStore`] is the raw backend contract (S3 in production, an
//! in-memory map in tests). [`ObjectStoreAdapter`] layers the key layout,
//! idempotent deletes and the two-phase move on top of it.

use crate::error::{Error, Result};
use crate::models::normalize_folder_name;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors reported by an object store backend
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ObjectStoreError {
    /// Wrap any backend failure
    pub fn backend<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Backend(error.into())
    }
}

/// Raw blob operations. Each call is independently atomic and independently
/// failing; nothing here spans more than one key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` at `key`, replacing any existing object
    async fn put(&self, key: &str, body: Bytes, content_type: &str)
        -> Result<(), ObjectStoreError>;

    /// Remove the object at `key`
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Server-side copy of `from` onto `to`
    async fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError>;

    /// Public location for `key`
    fn location(&self, key: &str) -> String;
}

/// Blob key with the fixed `{username}/{folder}/{filename}` layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    username: String,
    folder: String,
    filename: String,
}

impl ObjectKey {
    /// Build a key from raw request values. An empty folder maps to the
    /// default folder and folder and filename are sanitized. The username is
    /// taken verbatim, since two accounts must never share a prefix.
    pub fn new(username: &str, folder: &str, filename: &str) -> Result<Self> {
        if !is_valid_path_component(username) {
            return Err(Error::invalid("username is not a valid path component"));
        }

        Ok(Self {
            username: username.to_string(),
            folder: sanitize_path_component(normalize_folder_name(folder), "folder")?,
            filename: sanitize_path_component(filename, "filename")?,
        })
    }

    /// Recover the key from a stored location. The last three path segments
    /// are always `{username}/{folder}/{filename}`.
    pub fn from_location(location: &str) -> Result<Self> {
        let path = location
            .split(&['?', '#'][..])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');

        let mut segments = path.rsplit('/');
        let (Some(filename), Some(folder), Some(username)) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(Error::invalid(format!(
                "location does not contain an object key: {location}"
            )));
        };

        if [username, folder, filename].iter().any(|s| s.is_empty()) {
            return Err(Error::invalid(format!(
                "location does not contain an object key: {location}"
            )));
        }

        Ok(Self {
            username: username.to_string(),
            folder: folder.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Same object in a different folder
    pub fn with_folder(&self, folder: &str) -> Result<Self> {
        Ok(Self {
            username: self.username.clone(),
            folder: sanitize_path_component(normalize_folder_name(folder), "folder")?,
            filename: self.filename.clone(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Path form used as the backend key
    pub fn path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.username, self.folder, self.filename)
    }
}

/// A copy that has landed but whose source has not been deleted yet.
///
/// Produced by [`ObjectStoreAdapter::relocate`]. Both objects exist until the
/// caller either finishes (deletes the source) or discards (deletes the copy).
#[derive(Debug)]
#[must_use = "a pending relocation leaves two objects behind until finished or discarded"]
pub struct PendingRelocation {
    from: ObjectKey,
    to: ObjectKey,
    location: String,
}

impl PendingRelocation {
    pub fn source_key(&self) -> &ObjectKey {
        &self.from
    }

    pub fn target_key(&self) -> &ObjectKey {
        &self.to
    }

    /// Location of the new copy
    pub fn location(&self) -> &str {
        &self.location
    }
}

/// An object that should have been deleted but is still in the store and is
/// no longer referenced by any metadata row.
#[derive(Debug, Error)]
#[error("Orphaned object {key}: {source}")]
pub struct OrphanedObject {
    pub key: String,
    #[source]
    pub source: ObjectStoreError,
}

/// Key layout, idempotent delete and two-phase move over an [`ObjectStore`]
pub struct ObjectStoreAdapter {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreAdapter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Location a blob at `key` has, whether or not it exists yet
    pub fn location(&self, key: &ObjectKey) -> String {
        self.store.location(&key.path())
    }

    /// Store `body` at `key` and return its location. Re-putting a key
    /// overwrites it.
    #[instrument(skip_all, fields(key = %key, size_bytes = body.len()))]
    pub async fn put(&self, body: Bytes, key: &ObjectKey) -> Result<String> {
        let path = key.path();
        let content_type = get_content_type(key.filename());

        self.store.put(&path, body, content_type).await?;

        let location = self.store.location(&path);
        debug!(location = %location, "Object stored");
        Ok(location)
    }

    /// Delete `key`. A missing object counts as deleted.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match self.store.delete(&key.path()).await {
            Ok(()) => Ok(()),
            Err(ObjectStoreError::NotFound { .. }) => {
                debug!("Object already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// First phase of a move: copy `from` onto `to`.
    ///
    /// Fails with [`Error::CopyFailed`] when the copy did not happen; in that
    /// case nothing changed in the store.
    #[instrument(skip_all, fields(from = %from, to = %to))]
    pub async fn relocate(&self, from: &ObjectKey, to: &ObjectKey) -> Result<PendingRelocation> {
        let (from_path, to_path) = (from.path(), to.path());

        self.store
            .copy(&from_path, &to_path)
            .await
            .map_err(|source| Error::CopyFailed {
                from: from_path.clone(),
                to: to_path.clone(),
                source,
            })?;

        debug!("Object copied");

        Ok(PendingRelocation {
            from: from.clone(),
            to: to.clone(),
            location: self.store.location(&to_path),
        })
    }

    /// Second phase of a move: delete the source. On failure the source is
    /// left behind as an orphan and reported as such.
    pub async fn finish(&self, pending: PendingRelocation) -> Result<String, OrphanedObject> {
        self.delete_or_orphan(&pending.from).await?;
        info!(from = %pending.from, to = %pending.to, "Object relocated");
        Ok(pending.location)
    }

    /// Undo the first phase by deleting the copy. The source is untouched.
    pub async fn discard(&self, pending: PendingRelocation) -> Result<(), OrphanedObject> {
        self.delete_or_orphan(&pending.to).await
    }

    async fn delete_or_orphan(&self, key: &ObjectKey) -> Result<(), OrphanedObject> {
        match self.store.delete(&key.path()).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(source) => {
                warn!(key = %key, error = %source, "Object left orphaned");
                metrics::counter!("photos.objects.orphaned").increment(1);
                Err(OrphanedObject {
                    key: key.path(),
                    source,
                })
            }
        }
    }
}

/// True when `component` is usable as a key segment without any rewriting
pub fn is_valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        && !component.chars().all(|c| c == '.')
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str, field: &str) -> Result<String> {
    let sanitized: String = component
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return Err(Error::invalid(format!("{field} is not a valid path component")));
    }

    Ok(sanitized)
}

/// Content type from the filename extension
fn get_content_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}
