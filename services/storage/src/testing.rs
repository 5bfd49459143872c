//! In-memory stores for unit and router tests

use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::models::{clamp_page_limit, Folder, Image, Page, User};
use crate::object_store::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const MEMORY_BASE_URL: &str = "mem://photos";

/// Object store over a map, with switchable failures
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    pub fail_put: AtomicBool,
    pub fail_copy: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn insert(&self, key: &str, body: &'static [u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from_static(body));
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> Result<(), ObjectStoreError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::backend("put failed"));
        }
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::backend("delete failed"));
        }
        match self.objects.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(ObjectStoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        if self.fail_copy.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::backend("copy failed"));
        }
        let mut objects = self.objects.lock().unwrap();
        let body = objects
            .get(from)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                key: from.to_string(),
            })?;
        objects.insert(to.to_string(), body);
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("{MEMORY_BASE_URL}/{key}")
    }
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    folders: HashMap<Uuid, Folder>,
    images: HashMap<Uuid, Image>,
}

/// Metadata store over maps. Mirrors the Postgres constraints the pipeline
/// relies on: unique `(user_id, name)` folders, unique image urls and
/// cascading folder deletes.
#[derive(Default)]
pub struct MemoryMetadataStore {
    tables: Mutex<Tables>,
    pub fail_insert_image: AtomicBool,
    pub fail_update_image: AtomicBool,
    pub fail_delete_image: AtomicBool,
    /// Make the next `find_folder` miss, as if another writer had not
    /// committed yet
    pub hide_folder_once: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn folder_count(&self, user_id: Uuid) -> usize {
        let tables = self.tables.lock().unwrap();
        tables
            .folders
            .values()
            .filter(|f| f.user_id == user_id)
            .count()
    }

    pub fn image_count(&self) -> usize {
        self.tables.lock().unwrap().images.len()
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Internal(format!("{what} failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let taken = tables
            .users
            .values()
            .any(|u| u.username == user.username || u.email == user.email);
        if taken {
            return Err(Error::Conflict("duplicate user".to_string()));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.tables.lock().unwrap().users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn mark_user_verified(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        Ok(match tables.users.get_mut(&id) {
            Some(user) => {
                user.verified = true;
                true
            }
            None => false,
        })
    }

    async fn find_folder(&self, user_id: Uuid, name: &str) -> Result<Option<Folder>> {
        if self.hide_folder_once.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .folders
            .values()
            .find(|f| f.user_id == user_id && f.name == name)
            .cloned())
    }

    async fn insert_folder_if_absent(&self, folder: &Folder) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let exists = tables
            .folders
            .values()
            .any(|f| f.user_id == folder.user_id && f.name == folder.name);
        if exists {
            return Ok(false);
        }
        tables.folders.insert(folder.id, folder.clone());
        Ok(true)
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<Folder>> {
        Ok(self.tables.lock().unwrap().folders.get(&id).cloned())
    }

    async fn list_folders(
        &self,
        user_id: Uuid,
        cursor: Option<String>,
        limit: Option<i64>,
    ) -> Result<Page<Folder>> {
        let limit = clamp_page_limit(limit);
        let tables = self.tables.lock().unwrap();
        let mut folders: Vec<Folder> = tables
            .folders
            .values()
            .filter(|f| f.user_id == user_id)
            .filter(|f| cursor.as_ref().map_or(true, |c| &f.name > c))
            .cloned()
            .collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        folders.truncate(limit as usize);
        Ok(Page::from_rows(folders, limit))
    }

    async fn delete_folder(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let removed = tables.folders.remove(&id).is_some();
        tables.images.retain(|_, image| image.folder_id != id);
        Ok(removed)
    }

    async fn insert_image(&self, image: &Image) -> Result<()> {
        Self::injected(&self.fail_insert_image, "insert image")?;
        let mut tables = self.tables.lock().unwrap();
        if tables.images.values().any(|i| i.url == image.url) {
            return Err(Error::Conflict("duplicate image url".to_string()));
        }
        tables.images.insert(image.id, image.clone());
        Ok(())
    }

    async fn get_image(&self, id: Uuid) -> Result<Option<Image>> {
        Ok(self.tables.lock().unwrap().images.get(&id).cloned())
    }

    async fn find_image_by_url(&self, url: &str) -> Result<Option<Image>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.images.values().find(|i| i.url == url).cloned())
    }

    async fn update_image_location(&self, id: Uuid, folder_id: Uuid, url: &str) -> Result<bool> {
        Self::injected(&self.fail_update_image, "update image")?;
        let mut tables = self.tables.lock().unwrap();
        if tables.images.values().any(|i| i.id != id && i.url == url) {
            return Err(Error::Conflict("duplicate image url".to_string()));
        }
        Ok(match tables.images.get_mut(&id) {
            Some(image) => {
                image.folder_id = folder_id;
                image.url = url.to_string();
                true
            }
            None => false,
        })
    }

    async fn delete_image(&self, id: Uuid) -> Result<bool> {
        Self::injected(&self.fail_delete_image, "delete image")?;
        Ok(self.tables.lock().unwrap().images.remove(&id).is_some())
    }

    async fn list_images_by_user(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Page<Image>> {
        let limit = clamp_page_limit(limit);
        let tables = self.tables.lock().unwrap();
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|i| i.user_id == user_id)
            .filter(|i| cursor.map_or(true, |c| i.created_at < c))
            .cloned()
            .collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images.truncate(limit as usize);
        Ok(Page::from_rows(images, limit))
    }

    async fn list_images_by_folder(&self, folder_id: Uuid) -> Result<Vec<Image>> {
        let tables = self.tables.lock().unwrap();
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|i| i.folder_id == folder_id)
            .cloned()
            .collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(images)
    }
}
