//! Mirror sync of a build output to a remote bucket.

use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
};

use serde::Serialize;

use crate::{Cancellation, DeployError, ObjectStore, types::ScopedCredentials};

use super::AssetManifest;

/// What a sync changed in the remote bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Keys written, in upload order.
    pub uploaded: Vec<String>,
    /// Remote keys removed because they are absent from the build output.
    pub deleted: Vec<String>,
}

/// Makes a bucket's key set equal to a local build output.
///
/// Every local file is uploaded, then every remote key missing from the
/// local set is deleted. Deletion never starts before the last upload has
/// completed, and the first failed request aborts the sync.
///
/// A tripped [`Cancellation`] stops the sync before its next request. When it
/// trips during the upload phase nothing is deleted, so the bucket keeps a
/// superset of both the old and the new build.
pub struct AssetSyncEngine<'a, S> {
    store: &'a S,
    cancel: Cancellation,
}

impl<'a, S: ObjectStore> AssetSyncEngine<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            cancel: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Mirror `local_dir` into `bucket`.
    pub async fn sync(
        &self,
        local_dir: &Path,
        bucket: &str,
        credentials: &ScopedCredentials,
    ) -> Result<SyncReport, DeployError> {
        ensure_fresh(credentials)?;
        let manifest = AssetManifest::scan(local_dir).await?;

        tracing::info!(
            bucket,
            files = manifest.len(),
            bytes = manifest.total_bytes(),
            source = %local_dir.display(),
            "Syncing assets..."
        );

        self.mirror(&manifest, bucket, credentials).await
    }

    /// Remove every object from `bucket`.
    pub async fn purge(
        &self,
        bucket: &str,
        credentials: &ScopedCredentials,
    ) -> Result<SyncReport, DeployError> {
        tracing::info!(bucket, "Emptying bucket...");
        self.mirror(&AssetManifest::default(), bucket, credentials).await
    }

    /// Upload `manifest` then delete remote keys it does not contain.
    pub async fn mirror(
        &self,
        manifest: &AssetManifest,
        bucket: &str,
        credentials: &ScopedCredentials,
    ) -> Result<SyncReport, DeployError> {
        ensure_fresh(credentials)?;

        let mut report = SyncReport::default();

        for entry in &manifest.entries {
            self.cancel.check()?;
            self.store
                .put_object(credentials, bucket, &entry.key, &entry.content, entry.content_type)
                .await
                .map_err(|e| DeployError::Sync(format!("upload of {} failed: {e}", entry.key)))?;
            tracing::debug!(
                bucket,
                key = %entry.key,
                content_type = entry.content_type,
                "Uploaded"
            );
            report.uploaded.push(entry.key.clone());
        }

        if let Err(e) = self.cancel.check() {
            tracing::warn!(
                bucket,
                uploaded = report.uploaded.len(),
                "Sync cancelled after uploads, stale objects kept"
            );
            return Err(e);
        }
        // Credentials may have run out during a long upload phase.
        ensure_fresh(credentials)?;

        let local: HashSet<&str> = manifest.keys().collect();
        let orphaned: Vec<String> = self
            .list_all(bucket, credentials)
            .await?
            .into_iter()
            .filter(|key| !local.contains(key.as_str()))
            .collect();

        for key in orphaned {
            self.cancel.check()?;
            self.store
                .delete_object(credentials, bucket, &key)
                .await
                .map_err(|e| DeployError::Sync(format!("delete of {key} failed: {e}")))?;
            tracing::debug!(bucket, key = %key, "Deleted orphaned object");
            report.deleted.push(key);
        }

        tracing::info!(
            bucket,
            uploaded = report.uploaded.len(),
            deleted = report.deleted.len(),
            "Assets synced"
        );
        Ok(report)
    }

    /// Every key in `bucket`, following continuation tokens to the end.
    async fn list_all(
        &self,
        bucket: &str,
        credentials: &ScopedCredentials,
    ) -> Result<BTreeSet<String>, DeployError> {
        let mut keys = BTreeSet::new();
        let mut seen_tokens = HashSet::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .store
                .list_objects(credentials, bucket, token.as_deref())
                .await
                .map_err(|e| DeployError::Sync(format!("listing of {bucket} failed: {e}")))?;

            keys.extend(page.keys);

            match page.next_token {
                Some(next) if !seen_tokens.insert(next.clone()) => {
                    return Err(DeployError::Sync(format!(
                        "listing of {bucket} repeated continuation token {next}"
                    )));
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }
}

fn ensure_fresh(credentials: &ScopedCredentials) -> Result<(), DeployError> {
    if credentials.is_expired() {
        Err(DeployError::Authorization(format!(
            "scoped credentials expired at {}",
            credentials.expires_at
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeCall, FakeCloud};
    use chrono::Utc;
    use tempdir::TempDir;

    fn credentials() -> ScopedCredentials {
        ScopedCredentials {
            access_key: "AKIA".into(),
            secret_key: "secret".into(),
            session_token: "token".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn build_dir(files: &[&str]) -> TempDir {
        let dir = TempDir::new("stackdrop-sync").unwrap();
        for file in files {
            let path = dir.path().join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, file.as_bytes()).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_sync_replaces_remote_set() {
        let cloud = FakeCloud::new();
        cloud.seed_objects("site", ["index.html", "app.js", "old.css"]);
        let dir = build_dir(&["index.html", "app.js"]);

        let report = AssetSyncEngine::new(&cloud)
            .sync(dir.path(), "site", &credentials())
            .await
            .unwrap();

        let expected = BTreeSet::from(["index.html".to_string(), "app.js".to_string()]);
        assert_eq!(cloud.object_keys("site"), expected);
        let uploaded: BTreeSet<_> = report.uploaded.iter().cloned().collect();
        assert_eq!(uploaded, expected);
        assert_eq!(report.deleted, vec!["old.css".to_string()]);
    }

    #[tokio::test]
    async fn test_uploads_complete_before_any_delete() {
        let cloud = FakeCloud::new();
        cloud.seed_objects("site", ["a.txt", "b.txt", "c.txt"]);
        let dir = build_dir(&["x.html", "y.css", "nested/z.js"]);

        AssetSyncEngine::new(&cloud)
            .sync(dir.path(), "site", &credentials())
            .await
            .unwrap();

        let calls = cloud.calls();
        let last_put = calls.iter().rposition(|c| c.op == "put_object").unwrap();
        let first_delete = calls.iter().position(|c| c.op == "delete_object").unwrap();
        assert!(last_put < first_delete, "delete observed before upload finished: {calls:?}");
    }

    #[tokio::test]
    async fn test_listing_follows_continuation_tokens() {
        let cloud = FakeCloud::new().with_page_size(2);
        cloud.seed_objects("site", ["1", "2", "3", "4", "5"]);
        let dir = build_dir(&["index.html"]);

        let report = AssetSyncEngine::new(&cloud)
            .sync(dir.path(), "site", &credentials())
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 5);
        assert_eq!(cloud.object_keys("site").len(), 1);
        assert!(cloud.calls_named("list_objects") >= 3);
    }

    #[tokio::test]
    async fn test_failed_upload_aborts_without_deleting() {
        let cloud = FakeCloud::new();
        cloud.seed_objects("site", ["old.css"]);
        cloud.fail_upload("broken.js");
        let dir = build_dir(&["broken.js", "index.html"]);

        let err = AssetSyncEngine::new(&cloud)
            .sync(dir.path(), "site", &credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Sync(_)));
        assert_eq!(cloud.calls_named("delete_object"), 0);
        assert!(cloud.object_keys("site").contains("old.css"));
    }

    #[tokio::test]
    async fn test_expired_credentials_rejected_upfront() {
        let cloud = FakeCloud::new();
        let dir = build_dir(&["index.html"]);
        let expired = ScopedCredentials {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ..credentials()
        };

        let err = AssetSyncEngine::new(&cloud)
            .sync(dir.path(), "site", &expired)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Authorization(_)));
        assert!(cloud.calls().iter().all(|c: &FakeCall| c.op != "put_object"));
    }

    #[tokio::test]
    async fn test_purge_empties_bucket() {
        let cloud = FakeCloud::new();
        cloud.seed_objects("site", ["index.html", "app.js"]);

        let report = AssetSyncEngine::new(&cloud)
            .purge("site", &credentials())
            .await
            .unwrap();

        assert!(report.uploaded.is_empty());
        assert_eq!(report.deleted.len(), 2);
        assert!(cloud.object_keys("site").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_uploads_skips_deletes() {
        let cloud = FakeCloud::new();
        cloud.seed_objects("site", ["old.css"]);
        let cancel = Cancellation::new();
        cloud.cancel_on_upload("b.html", cancel.clone());
        let dir = build_dir(&["a.html", "b.html", "c.html"]);

        let err = AssetSyncEngine::new(&cloud)
            .with_cancellation(cancel)
            .sync(dir.path(), "site", &credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled));
        assert_eq!(cloud.calls_named("list_objects"), 0);
        assert_eq!(cloud.calls_named("delete_object"), 0);
        assert!(cloud.object_keys("site").contains("old.css"));
    }
}
