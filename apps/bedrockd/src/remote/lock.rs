use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use crate::backup::now_unix_seconds;

/// Well-known key of the marker object signaling exclusive ownership of the
/// remote backup set.
pub const LOCK_MARKER_KEY: &str = "BUCKET_LOCK";

/// Storage for the marker object, split from archive storage so lock
/// behavior is testable without a bucket.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn marker_exists(&self, key: &str) -> Result<bool>;
    async fn put_marker(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn remove_marker(&self, key: &str) -> Result<()>;
}

/// Places, checks, and removes the lock marker. At most one supervisor
/// instance should hold it; a marker left behind by a crash is cleared by an
/// operator, never automatically.
pub struct RemoteLock {
    store: Option<Arc<dyn MarkerStore>>,
}

impl RemoteLock {
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store: Some(store) }
    }

    /// With remote backups disabled there is no shared set to coordinate.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub async fn exists(&self) -> Result<bool> {
        match &self.store {
            Some(store) => store.marker_exists(LOCK_MARKER_KEY).await,
            None => Ok(false),
        }
    }

    /// Startup gate: refuses to claim the backup set when another instance's
    /// marker is already present. Runs before the server child is spawned, so
    /// a refusal never leaves a server running.
    pub async fn claim(&self) -> Result<()> {
        if self.exists().await? {
            bail!(
                "remote backup lock marker {LOCK_MARKER_KEY} is present; another supervisor \
                 instance may own this backup set. Confirm no other instance is running, then \
                 delete the {LOCK_MARKER_KEY} object from the bucket and start again"
            );
        }
        self.acquire().await
    }

    async fn acquire(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let marker = serde_json::json!({
            "host": std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            "pid": std::process::id(),
            "acquired-at": now_unix_seconds(),
        });
        store
            .put_marker(LOCK_MARKER_KEY, marker.to_string().into_bytes())
            .await?;
        info!("acquired remote backup lock");
        Ok(())
    }

    /// Runs only on graceful shutdown, after the final backup of the shutdown
    /// sequence. Abrupt termination leaves the marker in place, which the
    /// startup check exists to catch.
    pub async fn release(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.remove_marker(LOCK_MARKER_KEY).await?;
        info!("released remote backup lock");
        Ok(())
    }
}
