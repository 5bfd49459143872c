use crate::chunk_receiver::{ChunkReceiver, UploadChunk};
use crate::error::{Error, Result};
use crate::folder_resolver::FolderResolver;
use crate::metadata_store::MetadataStore;
use crate::models::{now, Folder, Image, Page};
use crate::move_orchestrator::{MoveOrchestrator, MoveOutcome, MoveRequest};
use crate::object_store::{ObjectKey, ObjectStore, ObjectStoreAdapter};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Image and folder operations for one authenticated user at a time.
///
/// Every read or mutation checks that the target belongs to the caller and
/// reports a foreign row as NotFound.
pub struct ImageService {
    store: Arc<dyn MetadataStore>,
    objects: Arc<ObjectStoreAdapter>,
    receiver: ChunkReceiver,
    folders: Arc<FolderResolver>,
    mover: MoveOrchestrator,
}

impl ImageService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        object_store: Arc<dyn ObjectStore>,
        max_upload_bytes: usize,
    ) -> Self {
        let objects = Arc::new(ObjectStoreAdapter::new(object_store));
        let folders = Arc::new(FolderResolver::new(store.clone()));

        Self {
            receiver: ChunkReceiver::new(objects.clone(), max_upload_bytes),
            mover: MoveOrchestrator::new(store.clone(), objects.clone(), folders.clone()),
            store,
            objects,
            folders,
        }
    }

    /// Ingest an upload stream and record it.
    ///
    /// The row is only written once the blob is stored. If the row cannot be
    /// written the blob is deleted again.
    #[instrument(skip(self, stream))]
    pub async fn upload<S, E>(&self, user_id: Uuid, stream: S) -> Result<Image>
    where
        S: Stream<Item = std::result::Result<UploadChunk, E>>,
        E: Display,
    {
        let result = self.ingest(user_id, stream).await;

        let status = if result.is_ok() { "success" } else { "failed" };
        metrics::counter!("photos.uploads.total", "status" => status).increment(1);

        result
    }

    async fn ingest<S, E>(&self, user_id: Uuid, stream: S) -> Result<Image>
    where
        S: Stream<Item = std::result::Result<UploadChunk, E>>,
        E: Display,
    {
        let upload = self.receiver.drain(stream).await?;

        // Putting onto an occupied key would overwrite another image's blob
        let location = self.objects.location(&upload.key);
        if self.store.find_image_by_url(&location).await?.is_some() {
            return Err(Error::Conflict(format!("{} already exists", upload.key)));
        }

        let receipt = self.receiver.store(upload).await?;

        let recorded = async {
            let folder = self.folders.resolve(user_id, receipt.key.folder()).await?;
            let image = Image {
                id: Uuid::new_v4(),
                name: receipt.key.filename().to_string(),
                url: receipt.location.clone(),
                user_id,
                folder_id: folder.id,
                created_at: now(),
            };
            self.store.insert_image(&image).await?;
            Ok::<_, Error>(image)
        }
        .await;

        match recorded {
            Ok(image) => {
                info!(image_id = %image.id, url = %image.url, "Image recorded");
                Ok(image)
            }
            Err(e) => {
                self.release(&receipt.key, &receipt.location, &e).await;
                Err(e)
            }
        }
    }

    /// Delete a blob whose row could not be written, unless a concurrent
    /// upload recorded a row for the same location first
    async fn release(&self, key: &ObjectKey, location: &str, cause: &Error) {
        match self.store.find_image_by_url(location).await {
            Ok(None) => {}
            Ok(Some(owner)) => {
                warn!(
                    key = %key,
                    owner = %owner.id,
                    error = %cause,
                    "Upload failed, object kept for existing row"
                );
                return;
            }
            Err(e) => {
                error!(
                    key = %key,
                    error = %e,
                    "Upload failed and object ownership is unknown, leaving it"
                );
                metrics::counter!("photos.objects.orphaned").increment(1);
                return;
            }
        }

        if let Err(cleanup) = self.objects.delete(key).await {
            error!(
                key = %key,
                error = %cleanup,
                "Upload failed and stored object could not be removed"
            );
            metrics::counter!("photos.objects.orphaned").increment(1);
        } else {
            warn!(key = %key, error = %cause, "Upload failed, stored object removed");
        }
    }

    pub async fn get_image(&self, user_id: Uuid, image_id: Uuid) -> Result<Image> {
        self.store
            .get_image(image_id)
            .await?
            .filter(|image| image.user_id == user_id)
            .ok_or_else(|| Error::not_found("image", image_id))
    }

    pub async fn move_image(&self, request: MoveRequest) -> Result<MoveOutcome> {
        self.mover.move_image(request).await
    }

    /// Delete the blob, then the row
    #[instrument(skip(self))]
    pub async fn delete_image(&self, user_id: Uuid, image_id: Uuid) -> Result<()> {
        let image = self.get_image(user_id, image_id).await?;
        self.remove(&image).await
    }

    async fn remove(&self, image: &Image) -> Result<()> {
        let key = ObjectKey::from_location(&image.url)?;
        self.objects.delete(&key).await?;

        if !self.store.delete_image(image.id).await? {
            warn!(image_id = %image.id, "Image row already gone");
        }

        metrics::counter!("photos.images.deleted").increment(1);
        Ok(())
    }

    pub async fn list_images(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Page<Image>> {
        self.store.list_images_by_user(user_id, cursor, limit).await
    }

    pub async fn list_folders(
        &self,
        user_id: Uuid,
        cursor: Option<String>,
        limit: Option<i64>,
    ) -> Result<Page<Folder>> {
        self.store.list_folders(user_id, cursor, limit).await
    }

    pub async fn list_folder_images(&self, user_id: Uuid, folder_id: Uuid) -> Result<Vec<Image>> {
        let folder = self.owned_folder(user_id, folder_id).await?;
        self.store.list_images_by_folder(folder.id).await
    }

    /// Delete every image in the folder (blob then row), then the folder.
    /// Stops at the first failure; images already removed stay removed.
    #[instrument(skip(self))]
    pub async fn delete_folder(&self, user_id: Uuid, folder_id: Uuid) -> Result<()> {
        let folder = self.owned_folder(user_id, folder_id).await?;
        let images = self.store.list_images_by_folder(folder.id).await?;
        let count = images.len();

        for image in &images {
            self.remove(image).await?;
        }

        self.store.delete_folder(folder.id).await?;
        info!(folder = %folder.name, images = count, "Folder deleted");
        Ok(())
    }

    async fn owned_folder(&self, user_id: Uuid, folder_id: Uuid) -> Result<Folder> {
        self.store
            .get_folder(folder_id)
            .await?
            .filter(|folder| folder.user_id == user_id)
            .ok_or_else(|| Error::not_found("folder", folder_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryMetadataStore, MemoryObjectStore};
    use bytes::Bytes;
    use futures::stream;
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryMetadataStore>,
        objects: Arc<MemoryObjectStore>,
        service: ImageService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryMetadataStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let service = ImageService::new(store.clone(), objects.clone(), 1024);
        Fixture {
            store,
            objects,
            service,
        }
    }

    fn chunks(
        folder: &str,
        filename: &str,
        parts: &[&'static [u8]],
    ) -> impl Stream<Item = std::result::Result<UploadChunk, String>> {
        let records: Vec<_> = parts
            .iter()
            .copied()
            .enumerate()
            .map(|(i, part)| {
                let mut record = UploadChunk::data(Bytes::from_static(part));
                if i == 0 {
                    record.username = "u1".to_string();
                    record.folder = folder.to_string();
                    record.filename = filename.to_string();
                }
                Ok(record)
            })
            .collect();
        stream::iter(records)
    }

    #[tokio::test]
    async fn test_upload_then_move_scenario() {
        let fx = fixture();
        let user = Uuid::new_v4();

        let image = fx
            .service
            .upload(user, chunks("", "cat.jpg", &[b"AB", b"CD", b"EF"]))
            .await
            .unwrap();

        assert_eq!(image.url, "mem://photos/u1/default/cat.jpg");
        assert_eq!(fx.objects.get("u1/default/cat.jpg").unwrap().as_ref(), b"ABCDEF");

        let outcome = fx
            .service
            .move_image(MoveRequest {
                image_id: image.id,
                user_id: user,
                new_folder: "trip".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.location, "mem://photos/u1/trip/cat.jpg");
        assert!(!fx.objects.contains("u1/default/cat.jpg"));
        assert_eq!(fx.objects.get("u1/trip/cat.jpg").unwrap().as_ref(), b"ABCDEF");

        let row = fx.service.get_image(user, image.id).await.unwrap();
        assert_eq!(row.url, outcome.location);
        let names: Vec<String> = fx
            .service
            .list_folders(user, None, None)
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["default", "trip"]);
    }

    #[tokio::test]
    async fn test_aborted_stream_creates_no_row() {
        let fx = fixture();
        let records = vec![
            Ok(UploadChunk {
                username: "u1".to_string(),
                filename: "cat.jpg".to_string(),
                chunk: Bytes::from_static(b"AB"),
                ..UploadChunk::default()
            }),
            Err("client went away".to_string()),
        ];

        let result = fx.service.upload(Uuid::new_v4(), stream::iter(records)).await;

        assert!(result.is_err());
        assert_eq!(fx.store.image_count(), 0);
        assert_eq!(fx.objects.len(), 0);
    }

    #[tokio::test]
    async fn test_failed_row_insert_removes_blob() {
        let fx = fixture();
        fx.store.fail_insert_image.store(true, Ordering::SeqCst);

        let result = fx
            .service
            .upload(Uuid::new_v4(), chunks("trip", "cat.jpg", &[b"AB"]))
            .await;

        assert!(result.is_err());
        assert_eq!(fx.store.image_count(), 0);
        assert!(!fx.objects.contains("u1/trip/cat.jpg"));
    }

    #[tokio::test]
    async fn test_reupload_of_same_name_conflicts() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let original = fx
            .service
            .upload(user, chunks("", "cat.jpg", &[b"OLD"]))
            .await
            .unwrap();

        let err = fx
            .service
            .upload(user, chunks("", "cat.jpg", &[b"NEW"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(fx.objects.get("u1/default/cat.jpg").unwrap().as_ref(), b"OLD");
        assert_eq!(fx.store.image_count(), 1);

        fx.service.delete_image(user, original.id).await.unwrap();
        assert!(!fx.objects.contains("u1/default/cat.jpg"));
        assert_eq!(fx.store.image_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_blob_owned_by_other_row() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let image = fx
            .service
            .upload(user, chunks("", "cat.jpg", &[b"OLD"]))
            .await
            .unwrap();

        let key = ObjectKey::new("u1", "", "cat.jpg").unwrap();
        let cause = Error::Conflict("duplicate image url".to_string());
        fx.service.release(&key, &image.url, &cause).await;

        assert!(fx.objects.contains("u1/default/cat.jpg"));
        assert!(fx.service.get_image(user, image.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_folder_listing_pages_by_name() {
        let fx = fixture();
        let user = Uuid::new_v4();
        for folder in ["c", "a", "b"] {
            fx.service
                .upload(user, chunks(folder, "x.jpg", &[b"x"]))
                .await
                .unwrap();
        }

        let first = fx.service.list_folders(user, None, Some(2)).await.unwrap();
        let names: Vec<_> = first.items.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(first.has_more);

        let second = fx
            .service
            .list_folders(user, first.next_cursor(), Some(2))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].name, "c");
        assert!(!second.has_more);

        let other = fx
            .service
            .list_folders(Uuid::new_v4(), None, None)
            .await
            .unwrap();
        assert!(other.items.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_scenario() {
        let fx = fixture();
        let user = Uuid::new_v4();

        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            fx.service
                .upload(user, chunks("", name, &[b"x"]))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let first = fx.service.list_images(user, None, Some(2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.items[0].name, "c.jpg");

        let second = fx
            .service
            .list_images(user, first.next_cursor(), Some(2))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(!second.has_more);
        assert_eq!(second.items[0].name, "a.jpg");
        assert!(second.next_cursor().is_none());
    }

    #[tokio::test]
    async fn test_pagination_terminates_without_duplicates() {
        let fx = fixture();
        let user = Uuid::new_v4();
        for i in 0..5 {
            fx.service
                .upload(user, chunks("", &format!("{i}.jpg"), &[b"x"]))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = fx.service.list_images(user, cursor, Some(2)).await.unwrap();
            seen.extend(page.items.iter().map(|i| i.created_at));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor();
        }

        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] > w[1]));
    }

    #[tokio::test]
    async fn test_delete_image_removes_blob_and_row() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let image = fx
            .service
            .upload(user, chunks("", "cat.jpg", &[b"AB"]))
            .await
            .unwrap();

        fx.service.delete_image(user, image.id).await.unwrap();

        assert!(!fx.objects.contains("u1/default/cat.jpg"));
        assert!(matches!(
            fx.service.get_image(user, image.id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_blob_delete_keeps_row() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let image = fx
            .service
            .upload(user, chunks("", "cat.jpg", &[b"AB"]))
            .await
            .unwrap();
        fx.objects.fail_delete.store(true, Ordering::SeqCst);

        assert!(fx.service.delete_image(user, image.id).await.is_err());
        assert!(fx.service.get_image(user, image.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_image_is_not_found() {
        let fx = fixture();
        let image = fx
            .service
            .upload(Uuid::new_v4(), chunks("", "cat.jpg", &[b"AB"]))
            .await
            .unwrap();

        let err = fx
            .service
            .delete_image(Uuid::new_v4(), image.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "image", .. }));
        assert!(fx.objects.contains("u1/default/cat.jpg"));
    }

    #[tokio::test]
    async fn test_delete_folder_removes_images() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let a = fx
            .service
            .upload(user, chunks("trip", "a.jpg", &[b"A"]))
            .await
            .unwrap();
        fx.service
            .upload(user, chunks("trip", "b.jpg", &[b"B"]))
            .await
            .unwrap();
        fx.service
            .upload(user, chunks("", "c.jpg", &[b"C"]))
            .await
            .unwrap();

        let listed = fx.service.list_folder_images(user, a.folder_id).await.unwrap();
        assert_eq!(listed.len(), 2);

        fx.service.delete_folder(user, a.folder_id).await.unwrap();

        assert!(!fx.objects.contains("u1/trip/a.jpg"));
        assert!(!fx.objects.contains("u1/trip/b.jpg"));
        assert!(fx.objects.contains("u1/default/c.jpg"));
        assert_eq!(fx.store.image_count(), 1);
        assert!(matches!(
            fx.service.list_folder_images(user, a.folder_id).await,
            Err(Error::NotFound { entity: "folder", .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_folder_is_not_found() {
        let fx = fixture();
        let image = fx
            .service
            .upload(Uuid::new_v4(), chunks("trip", "a.jpg", &[b"A"]))
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(fx
            .service
            .list_folder_images(stranger, image.folder_id)
            .await
            .is_err());
        assert!(fx
            .service
            .delete_folder(stranger, image.folder_id)
            .await
            .is_err());
        assert!(fx.objects.contains("u1/trip/a.jpg"));
    }
}
