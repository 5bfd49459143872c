use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::models::{normalize_folder_name, now, Folder};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Maps `(user, folder name)` to a folder row, creating it on first use.
///
/// Concurrent resolvers for the same pair converge on a single row: the
/// unique `(user_id, name)` constraint picks one winner and the losers
/// re-read it.
pub struct FolderResolver {
    store: Arc<dyn MetadataStore>,
}

impl FolderResolver {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, user_id: Uuid, name: &str) -> Result<Folder> {
        let name = normalize_folder_name(name);

        if let Some(folder) = self.store.find_folder(user_id, name).await? {
            return Ok(folder);
        }

        let candidate = Folder {
            id: Uuid::new_v4(),
            name: name.to_string(),
            user_id,
            created_at: now(),
        };

        if self.store.insert_folder_if_absent(&candidate).await? {
            debug!(folder_id = %candidate.id, "Folder created");
            metrics::counter!("photos.folders.created").increment(1);
            return Ok(candidate);
        }

        // Lost the race; the winner's row is committed by now
        self.store
            .find_folder(user_id, name)
            .await?
            .ok_or_else(|| Error::Internal(format!("folder {name} vanished after insert conflict")))
    }
}
