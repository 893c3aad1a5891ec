//! The build stage.
//!
//! A build moves through a fixed sequence of phases:
//!
//! ```text
//! Locating ──▶ Fetched ──────────────┐
//!    │                               ▼
//!    └──────▶ Scaffolded ──▶ Prepared ──▶ Compiled ──▶ Packaged ──▶ Done
//! ```
//!
//! `Locating` picks between the stored source and a template. Any phase can
//! fail, and the working directory is removed on every exit path.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use launchpad_core::archive::{pack_directory, unpack_archive};
use launchpad_core::{
    ArtifactKey, ArtifactStore, BuildJob, BuildOutcome, PipelineError, PipelineResult,
    RepositoryName, Scratch, TemplateKind, Toolchain, ZIP_CONTENT_TYPE,
};
use tracing::{debug, info, instrument};

use crate::lock::BuildLocks;
use crate::template::Scaffolder;

/// Where the build's source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Downloaded from the artifact store.
    Stored,
    /// Created from a starter template.
    Template(TemplateKind),
}

/// Phase of a build, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Checking the store for source.
    Locating,
    /// Stored source downloaded and extracted.
    Fetched,
    /// Template scaffolded and its source stored.
    Scaffolded,
    /// Working tree ready to compile.
    Prepared,
    /// Install and build finished.
    Compiled,
    /// Output packed and uploaded.
    Packaged,
    /// Finished.
    Done,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Locating => "locating",
            Self::Fetched => "fetched",
            Self::Scaffolded => "scaffolded",
            Self::Prepared => "prepared",
            Self::Compiled => "compiled",
            Self::Packaged => "packaged",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Settings the stage needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Bucket holding source and build archives.
    pub bucket: String,
    /// Fall back to a template even when the job did not ask for it.
    pub auto_template: bool,
    /// Directory names left out of scaffolded source archives.
    pub scaffold_exclude: Vec<String>,
}

/// Builds repositories from stored source or templates.
pub struct BuildStage {
    store: Arc<dyn ArtifactStore>,
    toolchain: Toolchain,
    scaffolder: Scaffolder,
    locks: BuildLocks,
    scratch: Scratch,
    settings: BuildSettings,
}

impl BuildStage {
    /// Create the stage. Working directories live under `scratch`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        toolchain: Toolchain,
        locks: BuildLocks,
        scratch: Scratch,
        settings: BuildSettings,
    ) -> Self {
        Self {
            store,
            scaffolder: Scaffolder::new(toolchain.clone()),
            toolchain,
            locks,
            scratch,
            settings,
        }
    }

    /// Bucket archives are read from and written to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.settings.bucket
    }

    /// Run a build job to completion.
    ///
    /// Holds the repository's build lock for the whole run.
    #[instrument(skip(self, job), fields(repo = %job.repository))]
    pub async fn build(&self, job: &BuildJob) -> PipelineResult<BuildOutcome> {
        let _permit = self.locks.acquire(&job.repository).await;

        let work = self.scratch.fresh_dir(job.repository.as_str()).await?;
        let result = self.run_job(job, work.path()).await;
        work.cleanup().await;
        if result.is_ok() {
            self.enter(&job.repository, BuildPhase::Done);
        }
        result
    }

    async fn run_job(&self, job: &BuildJob, work: &Path) -> PipelineResult<BuildOutcome> {
        let name = &job.repository;
        let tree = work.join("src");
        let source_key = ArtifactKey::source(&self.settings.bucket, name);

        self.enter(name, BuildPhase::Locating);
        let origin = if self.store.exists(&source_key).await? {
            self.fetch_stored(&source_key, work, &tree).await?;
            self.enter(name, BuildPhase::Fetched);
            SourceOrigin::Stored
        } else if job.use_template || self.settings.auto_template {
            self.scaffold(job.template, &source_key, work, &tree)
                .await?;
            self.enter(name, BuildPhase::Scaffolded);
            SourceOrigin::Template(job.template)
        } else {
            return Err(PipelineError::NotFound {
                bucket: source_key.bucket,
                object: source_key.object,
            });
        };
        self.enter(name, BuildPhase::Prepared);

        self.toolchain.compile(&tree).await?;
        self.enter(name, BuildPhase::Compiled);

        let output = self.toolchain.require_output(&tree)?;
        let build_key = ArtifactKey::build(&self.settings.bucket, name);
        self.package(&output, &build_key, work).await?;
        self.enter(name, BuildPhase::Packaged);

        Ok(BuildOutcome {
            repository: name.clone(),
            artifact: build_key,
            created_from: match origin {
                SourceOrigin::Stored => None,
                SourceOrigin::Template(kind) => Some(kind),
            },
        })
    }

    fn enter(&self, name: &RepositoryName, phase: BuildPhase) {
        info!(repo = %name, phase = %phase, "build phase");
    }

    async fn fetch_stored(&self, key: &ArtifactKey, work: &Path, tree: &Path) -> PipelineResult<()> {
        let archive = work.join("source.zip");
        self.store.get(key, &archive).await?;
        let entries = unpack_archive(&archive, tree).await?;
        tokio::fs::remove_file(&archive).await?;
        debug!(entries, "source extracted");
        Ok(())
    }

    async fn scaffold(
        &self,
        kind: TemplateKind,
        source_key: &ArtifactKey,
        work: &Path,
        tree: &Path,
    ) -> PipelineResult<()> {
        info!(template = %kind, "no stored source, scaffolding from template");
        self.scaffolder.scaffold(kind, tree).await?;

        let archive = work.join("source.zip");
        pack_directory(tree, &archive, &self.settings.scaffold_exclude).await?;
        self.store.put(source_key, &archive, ZIP_CONTENT_TYPE).await?;
        tokio::fs::remove_file(&archive).await?;
        Ok(())
    }

    async fn package(&self, output: &Path, key: &ArtifactKey, work: &Path) -> PipelineResult<()> {
        let archive = work.join("build.zip");
        let summary = pack_directory(output, &archive, &[]).await?;
        self.store.put(key, &archive, ZIP_CONTENT_TYPE).await?;
        info!(
            object = %key,
            entries = summary.entries,
            size = summary.bytes,
            "build archive stored"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::fs::File;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use launchpad_core::process::ProcessError;
    use launchpad_core::testing::{memory_store, ScriptedRunner};
    use launchpad_core::{
        CommandOutput, CommandSpec, ErrorKind, ObjectArtifactStore, ToolchainConfig,
    };
    use tempfile::TempDir;

    use super::*;
    use crate::lock::LockScope;

    /// Answers generator, install and build commands like a healthy toolchain,
    /// writing the build output into `output_dir`.
    fn healthy(
        output_dir: &'static str,
    ) -> impl Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static {
        move |cmd| {
            let cwd = cmd.cwd.clone().unwrap();
            match (cmd.program.as_str(), cmd.args.first().map(String::as_str)) {
                ("npx", _) => {
                    let dir = cwd.join(&cmd.args[1]);
                    std::fs::create_dir_all(dir.join("node_modules/react")).unwrap();
                    std::fs::write(dir.join("package.json"), "{}").unwrap();
                    std::fs::write(dir.join("node_modules/react/index.js"), "").unwrap();
                }
                ("npm", Some("run")) => {
                    let out = cwd.join(output_dir);
                    std::fs::create_dir_all(out.join("static")).unwrap();
                    std::fs::write(out.join("index.html"), "<html></html>").unwrap();
                    std::fs::write(out.join("static/app.js"), "app").unwrap();
                }
                _ => {}
            }
            Ok(CommandOutput::success(""))
        }
    }

    struct Fixture {
        temp: TempDir,
        store: Arc<ObjectArtifactStore>,
        runner: Arc<ScriptedRunner>,
        stage: BuildStage,
    }

    fn fixture(runner: ScriptedRunner, auto_template: bool) -> Fixture {
        scoped_fixture(runner, auto_template, LockScope::PerRepository)
    }

    fn scoped_fixture(runner: ScriptedRunner, auto_template: bool, scope: LockScope) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = memory_store("bucket");
        let runner = Arc::new(runner);
        let toolchain = Toolchain::new(runner.clone(), ToolchainConfig::default()).unwrap();
        let stage = BuildStage::new(
            store.clone(),
            toolchain,
            BuildLocks::new(scope),
            Scratch::new(temp.path().join("build")).unwrap(),
            BuildSettings {
                bucket: "bucket".into(),
                auto_template,
                scaffold_exclude: vec![".git".into(), "node_modules".into()],
            },
        );
        Fixture {
            temp,
            store,
            runner,
            stage,
        }
    }

    fn name() -> RepositoryName {
        RepositoryName::new("widget").unwrap()
    }

    async fn store_source(fx: &Fixture, files: &[(&str, &str)]) {
        let src = fx.temp.path().join("seed");
        for (path, contents) in files {
            let full = src.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        let archive = fx.temp.path().join("seed.zip");
        pack_directory(&src, &archive, &[]).await.unwrap();
        fx.store
            .put(&ArtifactKey::source("bucket", &name()), &archive, ZIP_CONTENT_TYPE)
            .await
            .unwrap();
    }

    async fn archive_entries(fx: &Fixture, object: &str) -> Vec<String> {
        let local = fx.temp.path().join(format!("check-{object}"));
        fx.store
            .get(&ArtifactKey::new("bucket", object), &local)
            .await
            .unwrap();
        let mut zip = zip::ZipArchive::new(File::open(&local).unwrap()).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_owned())
            .collect();
        names.sort();
        names
    }

    fn scratch_is_empty(fx: &Fixture) -> bool {
        std::fs::read_dir(fx.temp.path().join("build")).unwrap().count() == 0
    }

    #[tokio::test]
    async fn missing_source_without_template_is_not_found() {
        let fx = fixture(ScriptedRunner::new(healthy("build")), false);

        let err = fx.stage.build(&BuildJob::new(name())).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(fx.runner.calls().is_empty());
        assert!(fx.store.list("bucket").await.unwrap().is_empty());
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn template_fallback_stores_source_and_build() {
        let fx = fixture(ScriptedRunner::new(healthy("build")), false);
        let job = BuildJob::new(name()).with_template(TemplateKind::CreateReactApp);

        let outcome = fx.stage.build(&job).await.unwrap();

        assert_eq!(outcome.created_from, Some(TemplateKind::CreateReactApp));
        assert_eq!(outcome.artifact, ArtifactKey::new("bucket", "widget-build.zip"));
        assert_eq!(
            fx.store.list("bucket").await.unwrap(),
            vec!["widget-build.zip", "widget.zip"]
        );
        assert_eq!(archive_entries(&fx, "widget.zip").await, vec!["package.json"]);
        assert_eq!(fx.runner.programs(), vec!["npx", "npm", "npm"]);
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn auto_template_applies_without_request_flag() {
        let fx = fixture(ScriptedRunner::new(healthy("build")), true);

        let outcome = fx.stage.build(&BuildJob::new(name())).await.unwrap();
        assert_eq!(outcome.created_from, Some(TemplateKind::CreateReactApp));
    }

    #[tokio::test]
    async fn stored_source_builds_without_template() {
        let fx = fixture(ScriptedRunner::new(healthy("dist")), false);
        store_source(&fx, &[("package.json", "{}"), ("src/main.jsx", "app")]).await;

        let outcome = fx.stage.build(&BuildJob::new(name())).await.unwrap();

        assert_eq!(outcome.created_from, None);
        assert_eq!(
            archive_entries(&fx, "widget-build.zip").await,
            vec!["index.html", "static/app.js"]
        );
        assert_eq!(fx.runner.programs(), vec!["npm", "npm"]);
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn tree_without_descriptor_is_not_a_project() {
        let fx = fixture(ScriptedRunner::new(healthy("build")), false);
        store_source(&fx, &[("README.md", "hello")]).await;

        let err = fx.stage.build(&BuildJob::new(name())).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotAProject);
        assert!(fx.runner.calls().is_empty());
        assert_eq!(fx.store.list("bucket").await.unwrap(), vec!["widget.zip"]);
    }

    #[tokio::test]
    async fn install_failure_aborts_and_cleans_up() {
        let fx = fixture(
            ScriptedRunner::new(|cmd| {
                if cmd.args.first().map(String::as_str) == Some("install") {
                    Ok(CommandOutput::failure(1, "npm ERR! ETIMEDOUT"))
                } else {
                    Ok(CommandOutput::success(""))
                }
            }),
            false,
        );
        store_source(&fx, &[("package.json", "{}")]).await;

        let err = fx.stage.build(&BuildJob::new(name())).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Toolchain);
        assert!(err.to_string().contains("ETIMEDOUT"));
        assert_eq!(fx.store.list("bucket").await.unwrap(), vec!["widget.zip"]);
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn build_without_output_is_reported() {
        let fx = fixture(ScriptedRunner::succeeding(), false);
        store_source(&fx, &[("package.json", "{}")]).await;

        let err = fx.stage.build(&BuildJob::new(name())).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BuildOutputMissing);
        assert_eq!(fx.store.list("bucket").await.unwrap(), vec!["widget.zip"]);
    }

    #[test]
    fn phases_display() {
        assert_eq!(BuildPhase::Locating.to_string(), "locating");
        assert_eq!(BuildPhase::Done.to_string(), "done");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn global_lock_runs_builds_of_different_names_one_after_another() {
        let windows: Arc<Mutex<Vec<(String, Instant, Instant)>>> = Arc::default();
        let record = Arc::clone(&windows);
        let toolchain = healthy("build");
        let runner = ScriptedRunner::new(move |cmd| {
            let cwd = cmd.cwd.clone().unwrap();
            let repo = ["alpha", "beta"]
                .into_iter()
                .find(|n| cwd.components().any(|c| c.as_os_str() == *n))
                .unwrap();
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(30));
            let output = toolchain(cmd);
            record.lock().unwrap().push((repo.to_owned(), start, Instant::now()));
            output
        });
        let fx = Arc::new(scoped_fixture(runner, false, LockScope::Global));

        let builds: Vec<_> = ["alpha", "beta"]
            .into_iter()
            .map(|repo| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move {
                    let job = BuildJob::new(RepositoryName::new(repo).unwrap())
                        .with_template(TemplateKind::CreateReactApp);
                    fx.stage.build(&job).await
                })
            })
            .collect();
        for build in builds {
            build.await.unwrap().unwrap();
        }

        let windows = windows.lock().unwrap();
        let span = |repo: &str| {
            let calls: Vec<_> = windows.iter().filter(|(r, _, _)| r == repo).collect();
            assert_eq!(calls.len(), 3, "{repo} ran {} commands", calls.len());
            let start = calls.iter().map(|(_, s, _)| *s).min().unwrap();
            let end = calls.iter().map(|(_, _, e)| *e).max().unwrap();
            (start, end)
        };
        let (alpha_start, alpha_end) = span("alpha");
        let (beta_start, beta_end) = span("beta");
        assert!(
            alpha_end <= beta_start || beta_end <= alpha_start,
            "build windows overlapped"
        );
    }
}
