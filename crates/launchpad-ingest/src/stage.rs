//! The ingest stage.
//!
//! Validates a repository URL, fetches a working copy, packs it without VCS
//! metadata and stores `<name>.zip`. Re-ingesting a name overwrites the
//! stored archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use launchpad_core::archive::pack_directory;
use launchpad_core::protocol::IngestResponse;
use launchpad_core::{
    ArtifactKey, ArtifactStore, PipelineResult, RepositoryName, Scratch, SourceUrl,
    ZIP_CONTENT_TYPE,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::fetch::SourceFetcher;

/// Record of a completed ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Name derived from the URL.
    pub repository: RepositoryName,
    /// Where the source archive was stored.
    pub artifact: ArtifactKey,
    /// When the upload finished.
    pub timestamp: DateTime<Utc>,
}

impl From<&IngestReceipt> for IngestResponse {
    fn from(receipt: &IngestReceipt) -> Self {
        Self {
            message: "Repository cloned, zipped and uploaded".to_owned(),
            repo: receipt.repository.clone(),
            bucket: receipt.artifact.bucket.clone(),
            file: receipt.artifact.object.clone(),
            timestamp: receipt.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Settings the stage needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Bucket to store source archives in.
    pub bucket: String,
    /// Hosts repository URLs may point at. Empty allows any.
    pub allowed_hosts: Vec<String>,
    /// Directory names left out of the archive.
    pub exclude: Vec<String>,
}

/// Fetches repositories and stores their source archives.
pub struct IngestStage {
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn ArtifactStore>,
    scratch: Scratch,
    settings: IngestSettings,
}

impl IngestStage {
    /// Create the stage. Working copies live under `scratch`.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn ArtifactStore>,
        scratch: Scratch,
        settings: IngestSettings,
    ) -> Self {
        Self {
            fetcher,
            store,
            scratch,
            settings,
        }
    }

    /// Hosts repository URLs may point at.
    #[must_use]
    pub fn allowed_hosts(&self) -> &[String] {
        &self.settings.allowed_hosts
    }

    /// Ingest the repository at `url`.
    ///
    /// The URL is validated before any I/O. Each call works in its own
    /// scratch directory, removed whether or not the ingest succeeds.
    #[instrument(skip(self))]
    pub async fn ingest(&self, url: &str) -> PipelineResult<IngestReceipt> {
        let source = SourceUrl::parse(url, &self.settings.allowed_hosts)?;
        let name = source.repository().clone();
        info!(repo = %name, "ingesting repository");

        let work = self.scratch.fresh_dir(Uuid::new_v4().simple().to_string()).await?;
        let packed = self.fetch_and_pack(&source, work.path()).await;
        let key = ArtifactKey::source(&self.settings.bucket, &name);
        let stored = match packed {
            Ok(archive) => self.store.put(&key, &archive, ZIP_CONTENT_TYPE).await,
            Err(e) => Err(e),
        };
        work.cleanup().await;
        stored?;

        info!(repo = %name, object = %key, "source archive stored");
        Ok(IngestReceipt {
            repository: name,
            artifact: key,
            timestamp: Utc::now(),
        })
    }

    /// Fetch into `work` and pack the working copy, returning the archive path.
    async fn fetch_and_pack(&self, source: &SourceUrl, work: &Path) -> PipelineResult<PathBuf> {
        let name = source.repository();
        let checkout = work.join(name.as_str());
        tokio::fs::create_dir_all(&checkout).await?;

        self.fetcher.fetch(source, &checkout).await?;

        let archive = work.join(format!("{name}.zip"));
        let summary = pack_directory(&checkout, &archive, &self.settings.exclude).await?;
        info!(
            repo = %name,
            entries = summary.entries,
            size = summary.bytes,
            "source packed"
        );
        Ok(archive)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::fs::File;

    use async_trait::async_trait;
    use launchpad_core::testing::memory_store;
    use launchpad_core::{ErrorKind, ObjectArtifactStore, PipelineError};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;

    /// Writes a small tree, including `.git`, into the destination.
    #[derive(Default)]
    struct FakeFetcher {
        fail: bool,
        fetched: Mutex<Vec<String>>,
        contents: &'static str,
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn fetch(&self, url: &SourceUrl, dest: &Path) -> PipelineResult<()> {
            self.fetched.lock().push(url.to_string());
            if self.fail {
                return Err(PipelineError::Fetch {
                    url: url.to_string(),
                    message: "repository not found".into(),
                });
            }
            std::fs::write(dest.join("package.json"), self.contents)?;
            std::fs::create_dir_all(dest.join("src"))?;
            std::fs::write(dest.join("src/index.js"), "render()")?;
            std::fs::create_dir_all(dest.join(".git"))?;
            std::fs::write(dest.join(".git/HEAD"), "ref: refs/heads/main")?;
            Ok(())
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            bucket: "bucket".into(),
            allowed_hosts: vec!["github.com".into()],
            exclude: vec![".git".into()],
        }
    }

    fn stage(
        temp: &TempDir,
        fetcher: Arc<FakeFetcher>,
        store: Arc<ObjectArtifactStore>,
    ) -> IngestStage {
        let scratch = Scratch::new(temp.path().join("ingest")).unwrap();
        IngestStage::new(fetcher, store, scratch, settings())
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn stores_source_archive_without_vcs_metadata() {
        let temp = TempDir::new().unwrap();
        let store = memory_store("bucket");
        let fetcher = Arc::new(FakeFetcher {
            contents: "{}",
            ..FakeFetcher::default()
        });

        let receipt = stage(&temp, fetcher, store.clone())
            .ingest("https://github.com/org/widget")
            .await
            .unwrap();

        assert_eq!(receipt.repository.as_str(), "widget");
        assert_eq!(receipt.artifact, ArtifactKey::new("bucket", "widget.zip"));

        let downloaded = temp.path().join("check.zip");
        store.get(&receipt.artifact, &downloaded).await.unwrap();
        assert_eq!(
            entry_names(&downloaded),
            vec!["package.json", "src/index.js"]
        );
    }

    #[tokio::test]
    async fn reingest_overwrites_single_object() {
        let temp = TempDir::new().unwrap();
        let store = memory_store("bucket");

        for contents in ["{\"v\":1}", "{\"v\":2}"] {
            let fetcher = Arc::new(FakeFetcher {
                contents,
                ..FakeFetcher::default()
            });
            stage(&temp, fetcher, store.clone())
                .ingest("https://github.com/org/widget")
                .await
                .unwrap();
        }

        assert_eq!(store.list("bucket").await.unwrap(), vec!["widget.zip"]);
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_io() {
        let temp = TempDir::new().unwrap();
        let store = memory_store("bucket");
        let fetcher = Arc::new(FakeFetcher::default());

        let err = stage(&temp, fetcher.clone(), store.clone())
            .ingest("ftp://example.com/org/widget")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(fetcher.fetched.lock().is_empty());
        assert!(store.list("bucket").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_no_artifact_or_scratch() {
        let temp = TempDir::new().unwrap();
        let store = memory_store("bucket");
        let fetcher = Arc::new(FakeFetcher {
            fail: true,
            ..FakeFetcher::default()
        });

        let err = stage(&temp, fetcher, store.clone())
            .ingest("https://github.com/org/widget")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(store.list("bucket").await.unwrap().is_empty());
        let leftovers = std::fs::read_dir(temp.path().join("ingest")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn receipt_renders_rfc3339_timestamp() {
        let receipt = IngestReceipt {
            repository: RepositoryName::new("widget").unwrap(),
            artifact: ArtifactKey::new("bucket", "widget.zip"),
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let response = IngestResponse::from(&receipt);
        assert_eq!(response.timestamp, "2024-05-01T12:00:00Z");
        assert_eq!(response.file, "widget.zip");
    }
}
