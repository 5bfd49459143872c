use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::{clamp_page_limit, Folder, Image, Page, User};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Relational metadata for users, folders and images.
///
/// Every method is atomic at single-row granularity; none of them spans an
/// object-store call.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Round-trip to the backend, used by readiness checks
    async fn ping(&self) -> Result<()>;

    async fn insert_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Set `verified`. Returns false when the user does not exist.
    async fn mark_user_verified(&self, id: Uuid) -> Result<bool>;

    async fn find_folder(&self, user_id: Uuid, name: &str) -> Result<Option<Folder>>;

    /// Insert unless `(user_id, name)` is already taken. Returns whether this
    /// call created the row.
    async fn insert_folder_if_absent(&self, folder: &Folder) -> Result<bool>;

    async fn get_folder(&self, id: Uuid) -> Result<Option<Folder>>;

    /// Folders ordered by name, strictly after `cursor` when one is given.
    /// `limit` is clamped to `[1, 50]`.
    async fn list_folders(
        &self,
        user_id: Uuid,
        cursor: Option<String>,
        limit: Option<i64>,
    ) -> Result<Page<Folder>>;

    /// Delete a folder row; its image rows cascade
    async fn delete_folder(&self, id: Uuid) -> Result<bool>;

    async fn insert_image(&self, image: &Image) -> Result<()>;

    async fn get_image(&self, id: Uuid) -> Result<Option<Image>>;

    /// The image whose blob lives at `url`. `url` is unique across rows.
    async fn find_image_by_url(&self, url: &str) -> Result<Option<Image>>;

    /// Point an image at a new folder and blob location. Returns false when
    /// the row no longer exists.
    async fn update_image_location(&self, id: Uuid, folder_id: Uuid, url: &str) -> Result<bool>;

    async fn delete_image(&self, id: Uuid) -> Result<bool>;

    /// Newest-first page of a user's images, strictly older than `cursor`
    /// when one is given. `limit` is clamped to `[1, 50]`.
    async fn list_images_by_user(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Page<Image>>;

    /// Every image in a folder, newest first
    async fn list_images_by_folder(&self, folder_id: Uuid) -> Result<Vec<Image>>;
}

/// PostgreSQL-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password_hash, verified, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.verified)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, verified, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, verified, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    async fn mark_user_verified(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET verified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_folder(&self, user_id: Uuid, name: &str) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(
            r#"
            SELECT id, name, user_id, created_at
            FROM folders
            WHERE user_id = $1 AND name = $2
            "#,
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(folder)
    }

    #[instrument(skip(self, folder), fields(user_id = %folder.user_id, name = %folder.name))]
    async fn insert_folder_if_absent(&self, folder: &Folder) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO folders (id, name, user_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, name) DO NOTHING
            "#,
        )
        .bind(folder.id)
        .bind(&folder.name)
        .bind(folder.user_id)
        .bind(folder.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(
            "SELECT id, name, user_id, created_at FROM folders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(folder)
    }

    async fn list_folders(
        &self,
        user_id: Uuid,
        cursor: Option<String>,
        limit: Option<i64>,
    ) -> Result<Page<Folder>> {
        let limit = clamp_page_limit(limit);

        let folders = sqlx::query_as::<_, Folder>(
            r#"
            SELECT id, name, user_id, created_at
            FROM folders
            WHERE user_id = $1
              AND ($2::text IS NULL OR name > $2)
            ORDER BY name ASC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::from_rows(folders, limit))
    }

    #[instrument(skip(self))]
    async fn delete_folder(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM folders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, image), fields(image_id = %image.id, url = %image.url))]
    async fn insert_image(&self, image: &Image) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO images (id, name, url, user_id, folder_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(image.id)
        .bind(&image.name)
        .bind(&image.url)
        .bind(image.user_id)
        .bind(image.folder_id)
        .bind(image.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Image row inserted");
        Ok(())
    }

    async fn get_image(&self, id: Uuid) -> Result<Option<Image>> {
        let image = sqlx::query_as::<_, Image>(
            r#"
            SELECT id, name, url, user_id, folder_id, created_at
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    async fn find_image_by_url(&self, url: &str) -> Result<Option<Image>> {
        let image = sqlx::query_as::<_, Image>(
            r#"
            SELECT id, name, url, user_id, folder_id, created_at
            FROM images
            WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    #[instrument(skip(self))]
    async fn update_image_location(&self, id: Uuid, folder_id: Uuid, url: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE images SET folder_id = $1, url = $2 WHERE id = $3")
            .bind(folder_id)
            .bind(url)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_image(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_images_by_user(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Page<Image>> {
        let limit = clamp_page_limit(limit);

        let images = sqlx::query_as::<_, Image>(
            r#"
            SELECT id, name, url, user_id, folder_id, created_at
            FROM images
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::from_rows(images, limit))
    }

    async fn list_images_by_folder(&self, folder_id: Uuid) -> Result<Vec<Image>> {
        let images = sqlx::query_as::<_, Image>(
            r#"
            SELECT id, name, url, user_id, folder_id, created_at
            FROM images
            WHERE folder_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(images)
    }
}
