pub mod lock;
pub mod sync;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use tracing::info;

use crate::backup::retention::ArchiveStore;
use crate::backup::ARCHIVE_EXT;
use crate::config::RemoteConfig;

/// The durable replica of the backup set: one bucket per deployment, archive
/// objects under their archive names plus the lock marker object.
pub struct RemoteStore {
    client: Client,
    bucket: String,
}

/// Deterministic bucket name for a configured level name.
pub fn bucket_name(level_name: &str) -> String {
    let mut slug = String::new();
    for ch in level_name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    format!("{slug}-backups")
}

impl RemoteStore {
    pub async fn connect(config: &RemoteConfig, level_name: &str) -> Result<Self> {
        let region = Region::new(config.region.clone());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&base).region(region);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket_name(level_name),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn ensure_bucket(&self, region: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "created backup bucket");
                Ok(())
            }
            Err(err) => {
                let err = err.into_service_error();
                if err.is_bucket_already_owned_by_you() || err.is_bucket_already_exists() {
                    Ok(())
                } else {
                    Err(anyhow!("failed to create bucket {}: {err}", self.bucket))
                }
            }
        }
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!("failed to check {key} in {}: {err}", self.bucket))
                }
            }
        }
    }

    pub async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| anyhow!("failed to put {key} to {}: {err}", self.bucket))?;
        Ok(())
    }

    pub async fn upload_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to open {} for upload", path.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| anyhow!("failed to upload {key} to {}: {err}", self.bucket))?;
        Ok(())
    }

    pub async fn download_to(&self, key: &str, path: &Path) -> Result<()> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| anyhow!("failed to get {key} from {}: {err}", self.bucket))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|err| anyhow!("failed to read {key} body: {err}"))?
            .into_bytes();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| anyhow!("failed to delete {key} from {}: {err}", self.bucket))?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = request
                .send()
                .await
                .map_err(|err| anyhow!("failed to list {}: {err}", self.bucket))?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl lock::MarkerStore for RemoteStore {
    async fn marker_exists(&self, key: &str) -> Result<bool> {
        self.object_exists(key).await
    }

    async fn put_marker(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.put_bytes(key, bytes).await
    }

    async fn remove_marker(&self, key: &str) -> Result<()> {
        self.delete_object(key).await
    }
}

#[async_trait]
impl ArchiveStore for RemoteStore {
    fn tier_name(&self) -> &'static str {
        "remote"
    }

    /// The lock marker lives alongside the archives, so listing filters down
    /// to archive objects only.
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .list_keys()
            .await?
            .into_iter()
            .filter(|key| key.ends_with(ARCHIVE_EXT))
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.delete_object(name).await
    }
}
