//! Relocating an image between folders across both stores.
//!
//! Ordering is copy, metadata update, delete. Until the metadata row changes
//! the old object is authoritative; after that the new one is, and a failed
//! delete of the old object only leaves an unreferenced orphan behind.

use crate::error::{Error, Result};
use crate::folder_resolver::FolderResolver;
use crate::metadata_store::MetadataStore;
use crate::models::Image;
use crate::object_store::{ObjectKey, ObjectStoreAdapter, PendingRelocation};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub image_id: Uuid,
    pub user_id: Uuid,
    pub new_folder: String,
}

/// A move that took effect
#[derive(Debug, Clone, Serialize)]
pub struct MoveOutcome {
    /// The image row after the move
    pub image: Image,
    pub location: String,
    /// Old object that could not be deleted and is no longer referenced
    pub orphaned_key: Option<String>,
}

pub struct MoveOrchestrator {
    store: Arc<dyn MetadataStore>,
    objects: Arc<ObjectStoreAdapter>,
    folders: Arc<FolderResolver>,
}

impl MoveOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objects: Arc<ObjectStoreAdapter>,
        folders: Arc<FolderResolver>,
    ) -> Self {
        Self {
            store,
            objects,
            folders,
        }
    }

    /// Move an image into `new_folder`, creating the folder if needed.
    ///
    /// Any error means nothing changed: the row and the old object are as
    /// they were. A failed delete of the old object is reported through
    /// [`MoveOutcome::orphaned_key`] instead.
    #[instrument(skip(self), fields(image_id = %request.image_id, new_folder = %request.new_folder))]
    pub async fn move_image(&self, request: MoveRequest) -> Result<MoveOutcome> {
        let result = self.try_move(&request).await;

        let status = match &result {
            Ok(outcome) if outcome.orphaned_key.is_some() => "orphaned",
            Ok(_) => "completed",
            Err(_) => "failed",
        };
        metrics::counter!("photos.moves.total", "status" => status).increment(1);

        result
    }

    async fn try_move(&self, request: &MoveRequest) -> Result<MoveOutcome> {
        let image = self
            .store
            .get_image(request.image_id)
            .await?
            .filter(|image| image.user_id == request.user_id)
            .ok_or_else(|| Error::not_found("image", request.image_id))?;

        let from = ObjectKey::from_location(&image.url)?;
        let to = from.with_folder(&request.new_folder)?;

        // Folder rows use the sanitized name so they agree with the key layout
        let folder = self.folders.resolve(request.user_id, to.folder()).await?;

        // Same key: copying onto itself and deleting the source would lose it
        if from == to {
            let mut image = image;
            if folder.id != image.folder_id {
                self.store
                    .update_image_location(image.id, folder.id, &image.url)
                    .await?;
                image.folder_id = folder.id;
            }
            info!("Image already in target folder");
            let location = image.url.clone();
            return Ok(MoveOutcome {
                image,
                location,
                orphaned_key: None,
            });
        }

        // The copy would overwrite whatever blob another row keeps at `to`
        let target = self.objects.location(&to);
        if let Some(occupant) = self.store.find_image_by_url(&target).await? {
            warn!(occupant = %occupant.id, key = %to, "Move target already taken");
            return Err(Error::Conflict(format!("{to} already exists")));
        }

        let pending = self.objects.relocate(&from, &to).await?;
        let location = pending.location().to_string();

        match self
            .store
            .update_image_location(image.id, folder.id, &location)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.rollback(pending).await;
                return Err(Error::not_found("image", image.id));
            }
            Err(e) => {
                self.rollback(pending).await;
                return Err(e);
            }
        }

        let orphaned_key = match self.objects.finish(pending).await {
            Ok(_) => None,
            Err(orphan) => {
                warn!(
                    image_id = %image.id,
                    key = %orphan.key,
                    error = %orphan.source,
                    "Move committed but old object could not be deleted"
                );
                metrics::counter!("photos.moves.orphaned").increment(1);
                Some(orphan.key)
            }
        };

        info!(from = %from, to = %to, "Image moved");

        Ok(MoveOutcome {
            image: Image {
                folder_id: folder.id,
                url: location.clone(),
                ..image
            },
            location,
            orphaned_key,
        })
    }

    async fn rollback(&self, pending: PendingRelocation) {
        let target = pending.target_key().path();

        // A concurrent move or upload recorded a row at the target first
        match self.store.find_image_by_url(pending.location()).await {
            Ok(None) => {}
            Ok(Some(owner)) => {
                warn!(
                    key = %target,
                    owner = %owner.id,
                    "Copy target now owned by another row, kept"
                );
                return;
            }
            Err(e) => {
                error!(
                    key = %target,
                    error = %e,
                    "Could not check copy ownership, leaving it"
                );
                metrics::counter!("photos.objects.orphaned").increment(1);
                return;
            }
        }

        if let Err(orphan) = self.objects.discard(pending).await {
            error!(
                key = %orphan.key,
                error = %orphan.source,
                "Could not remove copy after failed metadata update"
            );
        } else {
            warn!(key = %target, "Metadata update failed, copy removed");
        }
    }
}
