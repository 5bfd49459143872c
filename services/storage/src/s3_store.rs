use crate::config::S3Config;
use crate::object_store::{ObjectStore, ObjectStoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

/// S3-backed object store for image blobs
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    base_url: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let base_url = config.public_base_url();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            base_url = %base_url,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            base_url,
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }

    /// Multipart upload for large objects. The upload is aborted if any part
    /// fails so no partial parts linger in the bucket.
    async fn multipart_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(key, &upload_id, body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        upload_id = %upload_id,
                        error = %abort_error,
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, body: Bytes) -> Result<()> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1;

        while offset < body.len() {
            let end = (offset + part_size).min(body.len());

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice(offset..end)))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            offset = end;
            part_number += 1;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .context("Failed to complete multipart upload")?;

        Ok(())
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), ObjectStoreError> {
        let result = if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await
        } else {
            self.simple_upload(key, body, content_type).await
        };

        result.map_err(ObjectStoreError::backend)?;
        debug!(key = %key, "Object uploaded to S3");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        // S3 reports success for keys that do not exist
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object from S3")
            .map_err(ObjectStoreError::backend)?;

        debug!(key = %key, "Object deleted from S3");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        let copy_source = format!("{}/{}", self.bucket, from);

        match self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(to)
            .send()
            .await
        {
            Ok(_) => {
                debug!(from = %from, to = %to, "Object copied in S3");
                Ok(())
            }
            Err(e) => {
                let missing = e
                    .raw_response()
                    .map(|response| response.status().as_u16() == 404)
                    .unwrap_or(false);

                if missing {
                    Err(ObjectStoreError::NotFound {
                        key: from.to_string(),
                    })
                } else {
                    Err(ObjectStoreError::backend(
                        anyhow::Error::new(e).context("Failed to copy object in S3"),
                    ))
                }
            }
        }
    }

    fn location(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}
