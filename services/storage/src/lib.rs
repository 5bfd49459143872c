//! Photos Storage Service
//!
//! Image ingestion, folder organization and relocation for the photos
//! platform. Image bytes arrive as an ordered chunk stream, are stored in S3
//! under `{username}/{folder}/{filename}`, and are recorded in PostgreSQL only
//! once the blob is durable.
//!
//! ## Features
//!
//! - **Streaming Ingestion**: Chunked uploads accumulated under a size cap,
//!   multipart uploads for large images
//! - **Lazy Folders**: Folders are created on first use; concurrent creators
//!   converge on one row
//! - **Cross-Store Moves**: Copy, metadata update, delete, with a typed report
//!   when the old object could not be removed
//! - **Keyset Pagination**: Newest-first image listings with a `created_at`
//!   cursor
//! - **Accounts**: Registration, email verification and bearer-token login
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API ──▶ Chunk Receiver ──▶ Object Store Adapter ──▶ S3
//!     │                                    ▲
//!     │                                    │
//!     ├──────▶ Move Orchestrator ──────────┤
//!     │              │
//!     │              ▼
//!     │        Folder Resolver
//!     │              │
//!     │              ▼
//!     └──────▶ Metadata Store ───────────────────────────▶ PostgreSQL
//! ```

pub mod accounts;
pub mod api;
pub mod chunk_receiver;
pub mod config;
pub mod error;
pub mod folder_resolver;
pub mod image_service;
pub mod metadata_store;
pub mod models;
pub mod move_orchestrator;
pub mod notifier;
pub mod object_store;
pub mod s3_store;
pub mod tokens;

#[cfg(test)]
mod testing;

pub use accounts::AccountService;
pub use api::{start_api_server, AppState};
pub use chunk_receiver::{BufferedUpload, ChunkReceiver, UploadChunk, UploadReceipt};
pub use config::Config;
pub use error::{Error, Result};
pub use folder_resolver::FolderResolver;
pub use image_service::ImageService;
pub use metadata_store::{MetadataStore, PgMetadataStore};
pub use models::{Folder, Image, Page, User};
pub use move_orchestrator::{MoveOrchestrator, MoveOutcome, MoveRequest};
pub use notifier::{Notifier, TracingNotifier};
pub use object_store::{ObjectKey, ObjectStore, ObjectStoreAdapter, ObjectStoreError};
pub use s3_store::S3ObjectStore;
pub use tokens::{JwtTokenService, TokenKind, TokenService};
