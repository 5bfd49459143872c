use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Folder name used when an upload does not name one
pub const DEFAULT_FOLDER: &str = "default";

/// Largest page a listing call will return
pub const MAX_PAGE_SIZE: i64 = 50;

/// Registered account
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Argon2 PHC string, never serialized
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Named group of images owned by one user
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Image metadata row. `url` locates the blob in the object store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub user_id: Uuid,
    pub folder_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One page of a keyset-paginated listing
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from rows fetched with `LIMIT limit`. A full page means
    /// there may be more rows past it.
    pub fn from_rows(items: Vec<T>, limit: i64) -> Self {
        let has_more = items.len() as i64 == limit;
        Self { items, has_more }
    }
}

impl Page<Image> {
    /// Cursor for the next page: the oldest `created_at` on this one
    pub fn next_cursor(&self) -> Option<DateTime<Utc>> {
        if self.has_more {
            self.items.last().map(|image| image.created_at)
        } else {
            None
        }
    }
}

impl Page<Folder> {
    /// Cursor for the next page: the last folder name on this one
    pub fn next_cursor(&self) -> Option<String> {
        if self.has_more {
            self.items.last().map(|folder| folder.name.clone())
        } else {
            None
        }
    }
}

/// Clamp a requested page size to `[1, MAX_PAGE_SIZE]`. Missing, zero,
/// negative and oversized requests all get the maximum.
pub fn clamp_page_limit(requested: Option<i64>) -> i64 {
    match requested {
        Some(limit) if (1..=MAX_PAGE_SIZE).contains(&limit) => limit,
        _ => MAX_PAGE_SIZE,
    }
}

/// Current time at the precision PostgreSQL stores, so a `created_at` handed
/// out as a cursor compares equal to the stored value
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Map an empty folder name onto the default folder
pub fn normalize_folder_name(name: &str) -> &str {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_FOLDER
    } else {
        trimmed
    }
}
