//! Static site hosting with single-page-application fallback.
//!
//! One listener serves whichever deployment was published last. Publishing a
//! new deployment swaps the serving root in place; the listener keeps running
//! after the deploy call returns and stops only on shutdown.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use launchpad_core::PipelineResult;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, error, info};

/// Entry-point document of a site.
pub const ENTRY_POINT: &str = "index.html";

/// Where a deployed tree is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingRoot {
    /// The whole extracted deployment.
    pub tree: PathBuf,
    /// Directory requests are resolved against.
    pub root: PathBuf,
    /// Entry-point document, if the tree has one.
    pub index: Option<PathBuf>,
}

/// Find the serving root of `tree`.
///
/// The root is the directory holding the shallowest `index.html`, searching
/// breadth first in name order and skipping hidden directories and
/// `node_modules`. Without an entry point the tree itself is served.
pub fn resolve_serving_root(tree: &Path) -> io::Result<ServingRoot> {
    let mut queue = VecDeque::from([tree.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let candidate = dir.join(ENTRY_POINT);
        if candidate.is_file() {
            return Ok(ServingRoot {
                tree: tree.to_path_buf(),
                root: dir,
                index: Some(candidate),
            });
        }

        let mut children = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == "node_modules" {
                continue;
            }
            children.push(entry.path());
        }
        children.sort();
        queue.extend(children);
    }

    Ok(ServingRoot {
        tree: tree.to_path_buf(),
        root: tree.to_path_buf(),
        index: None,
    })
}

type SharedRoot = Arc<RwLock<Option<ServingRoot>>>;

/// The long-lived static file server.
pub struct SiteHost {
    bind: SocketAddr,
    current: SharedRoot,
    bound: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl SiteHost {
    /// Host that will listen on `bind` once something is published.
    #[must_use]
    pub fn new(bind: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            bind,
            current: Arc::new(RwLock::new(None)),
            bound: Mutex::new(None),
            cancel,
        }
    }

    /// Router serving the current deployment.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(serve_site)
            .with_state(Arc::clone(&self.current))
    }

    /// The deployment being served.
    #[must_use]
    pub fn current(&self) -> Option<ServingRoot> {
        self.current.read().clone()
    }

    /// Serve `root` from now on, returning the deployment it replaces.
    pub fn swap(&self, root: ServingRoot) -> Option<ServingRoot> {
        self.current.write().replace(root)
    }

    /// Start listening if needed, then serve `root`.
    ///
    /// Returns the bound address and the replaced deployment.
    pub async fn publish(
        &self,
        root: ServingRoot,
    ) -> PipelineResult<(SocketAddr, Option<ServingRoot>)> {
        let addr = self.ensure_listening().await?;
        let previous = self.swap(root);
        info!(addr = %addr, root = ?self.current().map(|r| r.root), "site published");
        Ok((addr, previous))
    }

    async fn ensure_listening(&self) -> PipelineResult<SocketAddr> {
        let mut bound = self.bound.lock().await;
        if let Some(addr) = *bound {
            return Ok(addr);
        }

        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "site server failed");
            }
            info!("site server stopped");
        });

        info!(addr = %addr, "site server listening");
        *bound = Some(addr);
        Ok(addr)
    }

    /// Stop the listener.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Serve a file from the current root, or the entry point for the root path,
/// directory paths and anything missing.
async fn serve_site(State(current): State<SharedRoot>, request: Request) -> Response {
    let Some(site) = current.read().clone() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no site published").into_response();
    };
    debug!(path = %request.uri().path(), "site request");

    let files = ServeDir::new(&site.root).append_index_html_on_directories(false);
    match site.index {
        Some(index) if request.uri().path().ends_with('/') => {
            match ServeFile::new(index).oneshot(request).await {
                Ok(response) => response.into_response(),
                Err(e) => internal(&e),
            }
        }
        Some(index) => match files.fallback(ServeFile::new(index)).oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(e) => internal(&e),
        },
        None => match files.oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(e) => internal(&e),
        },
    }
}

fn internal(e: &dyn std::fmt::Display) -> Response {
    error!(error = %e, "failed to serve file");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::body::Body;
    use axum::http;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    use super::*;

    fn write(root: &Path, path: &str, contents: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    fn host() -> SiteHost {
        SiteHost::new(SocketAddr::from(([127, 0, 0, 1], 0)), CancellationToken::new())
    }

    async fn get(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(http::Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[test]
    fn root_is_directory_of_shallowest_index() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "nested/deeper/index.html", "deep");
        write(temp.path(), "b/index.html", "b");
        write(temp.path(), "a/index.html", "a");
        write(temp.path(), "node_modules/pkg/index.html", "pkg");

        let root = resolve_serving_root(temp.path()).unwrap();
        assert_eq!(root.root, temp.path().join("a"));
        assert_eq!(root.index, Some(temp.path().join("a/index.html")));
    }

    #[test]
    fn top_level_index_wins() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "index.html", "top");
        write(temp.path(), "a/index.html", "a");

        assert_eq!(resolve_serving_root(temp.path()).unwrap().root, temp.path());
    }

    #[test]
    fn tree_without_index_serves_top_level() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "assets/app.js", "app");
        write(temp.path(), ".cache/index.html", "hidden");

        let root = resolve_serving_root(temp.path()).unwrap();
        assert_eq!(root.root, temp.path());
        assert!(root.index.is_none());
    }

    #[tokio::test]
    async fn serves_files_verbatim_and_falls_back_to_index() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "index.html", "<h1>app</h1>");
        write(temp.path(), "static/app.js", "console.log(1)");
        let host = host();
        host.swap(resolve_serving_root(temp.path()).unwrap());

        assert_eq!(
            get(host.router(), "/static/app.js").await,
            (StatusCode::OK, "console.log(1)".to_owned())
        );
        for path in ["/", "/dashboard/settings", "/static/", "/missing.js"] {
            assert_eq!(
                get(host.router(), path).await,
                (StatusCode::OK, "<h1>app</h1>".to_owned()),
                "{path}"
            );
        }
    }

    #[tokio::test]
    async fn without_index_missing_paths_are_not_found() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "app.js", "app");
        let host = host();
        host.swap(resolve_serving_root(temp.path()).unwrap());

        assert_eq!(get(host.router(), "/app.js").await.0, StatusCode::OK);
        assert_eq!(get(host.router(), "/other").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn nothing_published_is_unavailable() {
        assert_eq!(
            get(host().router(), "/").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn publish_binds_once_and_swaps_root() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write(first.path(), "index.html", "one");
        write(second.path(), "index.html", "two");
        let host = host();

        let (addr, previous) = host
            .publish(resolve_serving_root(first.path()).unwrap())
            .await
            .unwrap();
        assert!(previous.is_none());

        let (again, previous) = host
            .publish(resolve_serving_root(second.path()).unwrap())
            .await
            .unwrap();
        assert_eq!(addr, again);
        assert_eq!(previous.unwrap().tree, first.path());
        assert_eq!(get(host.router(), "/").await.1, "two");

        host.shutdown();
    }
}
