//! Streaming ingestion of one image.
//!
//! A client sends an ordered sequence of [`UploadChunk`] records. The first
//! record names the object; every record contributes bytes. Nothing reaches
//! the object store until the stream has ended cleanly.

use crate::error::{Error, Result};
use crate::object_store::{ObjectKey, ObjectStoreAdapter};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// One record of an upload stream. Only the first record's naming fields
/// are read.
#[derive(Debug, Clone, Default)]
pub struct UploadChunk {
    pub username: String,
    pub folder: String,
    pub filename: String,
    pub chunk: Bytes,
}

impl UploadChunk {
    /// A continuation record carrying bytes only
    pub fn data(chunk: impl Into<Bytes>) -> Self {
        Self {
            chunk: chunk.into(),
            ..Self::default()
        }
    }
}

/// Result of a completed upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: ObjectKey,
    pub location: String,
    pub size_bytes: usize,
}

/// A fully drained upload that has not reached the object store
#[derive(Debug)]
pub struct BufferedUpload {
    pub key: ObjectKey,
    body: Bytes,
    started: Instant,
}

impl BufferedUpload {
    pub fn size_bytes(&self) -> usize {
        self.body.len()
    }
}

pub struct ChunkReceiver {
    objects: Arc<ObjectStoreAdapter>,
    max_bytes: usize,
}

impl ChunkReceiver {
    pub fn new(objects: Arc<ObjectStoreAdapter>, max_bytes: usize) -> Self {
        Self { objects, max_bytes }
    }

    /// Drain `stream` into one buffer and store it.
    ///
    /// A read error, an oversized payload or an empty stream aborts before
    /// the object store is touched.
    pub async fn receive<S, E>(&self, stream: S) -> Result<UploadReceipt>
    where
        S: Stream<Item = std::result::Result<UploadChunk, E>>,
        E: Display,
    {
        let upload = self.drain(stream).await?;
        self.store(upload).await
    }

    /// Drain `stream` into one buffer without storing it, so the caller can
    /// inspect the key first
    #[instrument(skip_all)]
    pub async fn drain<S, E>(&self, stream: S) -> Result<BufferedUpload>
    where
        S: Stream<Item = std::result::Result<UploadChunk, E>>,
        E: Display,
    {
        let started = Instant::now();
        let mut stream = std::pin::pin!(stream);

        let first = match stream.next().await {
            Some(record) => record.map_err(read_error)?,
            None => return Err(Error::invalid("upload stream carried no records")),
        };

        let key = ObjectKey::new(&first.username, &first.folder, &first.filename)?;
        let mut buffer = BytesMut::new();
        self.append(&mut buffer, &first.chunk)?;
        let mut chunks = 1usize;

        while let Some(record) = stream.next().await {
            let record = record.map_err(read_error)?;
            self.append(&mut buffer, &record.chunk)?;
            chunks += 1;
        }

        debug!(key = %key, chunks, size_bytes = buffer.len(), "Upload stream drained");

        Ok(BufferedUpload {
            key,
            body: buffer.freeze(),
            started,
        })
    }

    /// Put a drained upload into the object store
    #[instrument(skip_all, fields(key = %upload.key))]
    pub async fn store(&self, upload: BufferedUpload) -> Result<UploadReceipt> {
        let size_bytes = upload.body.len();
        let location = self.objects.put(upload.body, &upload.key).await?;

        metrics::counter!("photos.bytes.uploaded").increment(size_bytes as u64);
        metrics::histogram!("photos.uploads.receive_duration_seconds")
            .record(upload.started.elapsed().as_secs_f64());

        info!(key = %upload.key, size_bytes, "Upload stored");

        Ok(UploadReceipt {
            key: upload.key,
            location,
            size_bytes,
        })
    }

    fn append(&self, buffer: &mut BytesMut, chunk: &[u8]) -> Result<()> {
        if buffer.len() + chunk.len() > self.max_bytes {
            return Err(Error::PayloadTooLarge {
                limit: self.max_bytes,
            });
        }
        buffer.extend_from_slice(chunk);
        Ok(())
    }
}

fn read_error<E: Display>(error: E) -> Error {
    Error::Internal(format!("upload stream read failed: {error}"))
}
