//! Request routing
//!
//! Resolves the backend URI for every inbound request and runs the completion hook once
//! the backend has answered. Paths are handled as raw strings so percent-encoding and the
//! query string reach the backend exactly as the client sent them.

use crate::cluster::ClusterRegistry;
use crate::directory::{authority_of, Directory};
use crate::telemetry::{RequestRecord, TelemetrySink};
use hyper::{Method, Uri};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of the runner API
pub const API_PREFIX: &str = "/api/v1";
/// Prefix of per-application runner API paths
const APPS_PREFIX: &str = "/api/v1/apps/";

/// Where a request should be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Absolute backend URI including the query string
    pub uri: String,
    /// Lowercased `host:port` of the backend
    pub authority: String,
    /// Application the request was resolved through, if any
    pub app: Option<String>,
    /// Application this request deletes on the runner, if it is a deletion call
    pub deletes: Option<String>,
}

pub struct Router {
    directory: Arc<Directory>,
    registry: Arc<ClusterRegistry>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl Router {
    pub fn new(directory: Arc<Directory>, registry: Arc<ClusterRegistry>) -> Self {
        Self {
            directory,
            registry,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Resolve the backend for a request, or `None` when nothing serves this path
    pub fn resolve(&self, method: &Method, path_and_query: &str) -> Option<Target> {
        let (path, query) = match path_and_query.find('?') {
            Some(pos) => path_and_query.split_at(pos),
            None => (path_and_query, ""),
        };

        let target = if path == API_PREFIX || path.starts_with("/api/v1/") {
            self.resolve_api(method, path, path_and_query)
        } else {
            self.resolve_app(path, query)
        };

        if target.is_none() {
            debug!(%method, path, "No route for request");
        }
        target
    }

    /// Runner API paths keep their path. Per-app paths go to the app's runner, the
    /// rest to the earliest registered runner.
    fn resolve_api(&self, method: &Method, path: &str, path_and_query: &str) -> Option<Target> {
        if let Some(rest) = path.strip_prefix(APPS_PREFIX) {
            let (name, tail) = match rest.find('/') {
                Some(pos) => rest.split_at(pos),
                None => (rest, ""),
            };
            if !name.is_empty() {
                let location = self.directory.get(name)?;
                let (origin, authority) = origin_of(&location)?;
                let deletes = (method == Method::DELETE && (tail.is_empty() || tail == "/"))
                    .then(|| name.to_string());
                return Some(Target {
                    uri: format!("{}{}", origin, path_and_query),
                    authority,
                    app: Some(name.to_string()),
                    deletes,
                });
            }
        }

        let runner = self.registry.first()?;
        let (origin, authority) = origin_of(runner.url())?;
        Some(Target {
            uri: format!("{}{}", origin, path_and_query),
            authority,
            app: None,
            deletes: None,
        })
    }

    /// The first path segment names the application; it is replaced by the backend's
    /// own path and the remainder is appended untouched.
    fn resolve_app(&self, path: &str, query: &str) -> Option<Target> {
        let trimmed = path.strip_prefix('/')?;
        let (name, rest) = match trimmed.find('/') {
            Some(pos) => trimmed.split_at(pos),
            None => (trimmed, ""),
        };
        if name.is_empty() {
            return None;
        }

        let location = self.directory.get(name)?;
        let uri: Uri = location.parse().ok()?;
        let (origin, authority) = origin_of(&location)?;
        let base_path = uri.path().trim_end_matches('/');

        let mut backend_path = format!("{}{}", base_path, rest);
        if backend_path.is_empty() {
            backend_path.push('/');
        }
        Some(Target {
            uri: format!("{}{}{}", origin, backend_path, query),
            authority,
            app: Some(name.to_string()),
            deletes: None,
        })
    }

    /// Run after the backend has answered.
    ///
    /// A successful deletion call drops the application from the directory. The record is
    /// then finished and handed to the telemetry sink, if one is configured.
    pub fn complete(&self, target: Option<&Target>, mut record: RequestRecord, status: u16) {
        if let Some(target) = target {
            if record.app.is_none() {
                record.app = target.app.clone();
            }
            record.target = Some(target.authority.clone());

            if let Some(name) = target.deletes.as_deref() {
                if (200..300).contains(&status) && self.directory.remove(name).is_some() {
                    self.registry.recount(&self.directory.snapshot());
                    let runner_id = self
                        .registry
                        .lookup_by_authority(&target.authority)
                        .map(|r| r.id().to_string());
                    info!(app = name, runner_id = ?runner_id, "Application deleted");
                }
            }
        }

        record.finish(status);
        if let Some(ref sink) = self.telemetry {
            sink.accept(record);
        }
    }
}

/// Split an absolute URL into `scheme://authority` and its lowercased authority
fn origin_of(url: &str) -> Option<(String, String)> {
    let uri: Uri = url.parse().ok()?;
    let scheme = uri.scheme_str()?;
    let authority = uri.authority()?;
    Some((
        format!("{}://{}", scheme, authority.as_str()),
        authority_of(url)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Runner;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CapturingSink {
        records: Mutex<Vec<RequestRecord>>,
    }

    impl TelemetrySink for CapturingSink {
        fn accept(&self, record: RequestRecord) {
            self.records.lock().push(record);
        }
    }

    struct Fixture {
        router: Router,
        directory: Arc<Directory>,
        registry: Arc<ClusterRegistry>,
        sink: Arc<CapturingSink>,
        _tmp: TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(ClusterRegistry::open(tmp.path().join("cluster.json")).unwrap());
        registry
            .add(Runner::new("first", "http://runner-a:9000", 4).unwrap())
            .unwrap();
        registry
            .add(Runner::new("second", "http://runner-b:9000", 4).unwrap())
            .unwrap();

        let directory = Arc::new(Directory::new());
        directory.add("shop", "http://runner-b:9000/shop");
        directory.add("blog", "http://runner-a:9000/blog");

        let sink = Arc::new(CapturingSink::default());
        let router = Router::new(Arc::clone(&directory), Arc::clone(&registry))
            .with_telemetry(Arc::clone(&sink) as Arc<dyn TelemetrySink>);
        Fixture {
            router,
            directory,
            registry,
            sink,
            _tmp: tmp,
        }
    }

    #[test]
    fn test_app_path_rewrite_preserves_rest_and_query() {
        let f = fixture();
        let target = f
            .router
            .resolve(&Method::GET, "/shop/cart/a%20b?x=1&y=%2F")
            .unwrap();

        assert_eq!(target.uri, "http://runner-b:9000/shop/cart/a%20b?x=1&y=%2F");
        assert_eq!(target.authority, "runner-b:9000");
        assert_eq!(target.app.as_deref(), Some("shop"));
        assert!(target.deletes.is_none());
    }

    #[test]
    fn test_app_root_and_query_only() {
        let f = fixture();
        assert_eq!(
            f.router.resolve(&Method::GET, "/shop").unwrap().uri,
            "http://runner-b:9000/shop"
        );
        assert_eq!(
            f.router.resolve(&Method::GET, "/shop?debug").unwrap().uri,
            "http://runner-b:9000/shop?debug"
        );
    }

    #[test]
    fn test_rewrite_to_different_backend_path() {
        let f = fixture();
        f.directory.add("legacy", "http://runner-a:9000/apps/v2/legacy/");

        let target = f.router.resolve(&Method::POST, "/legacy/api/items?page=2").unwrap();
        assert_eq!(target.uri, "http://runner-a:9000/apps/v2/legacy/api/items?page=2");

        f.directory.add("rooted", "http://runner-a:9000");
        let target = f.router.resolve(&Method::GET, "/rooted").unwrap();
        assert_eq!(target.uri, "http://runner-a:9000/");
    }

    #[test]
    fn test_unknown_paths_have_no_target() {
        let f = fixture();
        assert!(f.router.resolve(&Method::GET, "/missing/page").is_none());
        assert!(f.router.resolve(&Method::GET, "/").is_none());
        assert!(f.router.resolve(&Method::GET, "/api/v1/apps/missing").is_none());
    }

    #[test]
    fn test_api_paths_go_to_first_runner() {
        let f = fixture();
        let target = f.router.resolve(&Method::GET, "/api/v1/samples?lang=java").unwrap();
        assert_eq!(target.uri, "http://runner-a:9000/api/v1/samples?lang=java");
        assert!(target.app.is_none());

        let target = f.router.resolve(&Method::GET, "/api/v1").unwrap();
        assert_eq!(target.uri, "http://runner-a:9000/api/v1");
    }

    #[test]
    fn test_api_paths_without_runners() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(ClusterRegistry::open(tmp.path().join("c.json")).unwrap());
        let router = Router::new(Arc::new(Directory::new()), registry);
        assert!(router.resolve(&Method::GET, "/api/v1/system").is_none());
    }

    #[test]
    fn test_app_api_paths_resolve_through_directory() {
        let f = fixture();
        let target = f.router.resolve(&Method::GET, "/api/v1/apps/shop/logs?tail=10").unwrap();
        assert_eq!(target.uri, "http://runner-b:9000/api/v1/apps/shop/logs?tail=10");
        assert_eq!(target.app.as_deref(), Some("shop"));
        assert!(target.deletes.is_none());

        let target = f.router.resolve(&Method::DELETE, "/api/v1/apps/shop").unwrap();
        assert_eq!(target.deletes.as_deref(), Some("shop"));

        let target = f.router.resolve(&Method::DELETE, "/api/v1/apps/shop/logs").unwrap();
        assert!(target.deletes.is_none());
    }

    #[test]
    fn test_successful_deletion_removes_entry_and_recounts() {
        let f = fixture();
        f.registry.recount(&f.directory.snapshot());
        assert_eq!(f.registry.lookup("second").unwrap().observed_app_count(), 1);

        let target = f.router.resolve(&Method::DELETE, "/api/v1/apps/shop").unwrap();
        let record = RequestRecord::begin("127.0.0.1:5000", "DELETE");
        f.router.complete(Some(&target), record, 204);

        assert!(f.directory.get("shop").is_none());
        assert_eq!(f.registry.lookup("second").unwrap().observed_app_count(), 0);

        let records = f.sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Some(204));
        assert_eq!(records[0].app.as_deref(), Some("shop"));
        assert_eq!(records[0].target.as_deref(), Some("runner-b:9000"));
        assert!(records[0].end.is_some());
    }

    #[test]
    fn test_failed_deletion_keeps_entry() {
        let f = fixture();
        let target = f.router.resolve(&Method::DELETE, "/api/v1/apps/shop").unwrap();
        f.router
            .complete(Some(&target), RequestRecord::begin("127.0.0.1:5000", "DELETE"), 500);

        assert!(f.directory.get("shop").is_some());
        assert_eq!(f.sink.records.lock()[0].status, Some(500));
    }

    #[test]
    fn test_completion_without_target_still_emits() {
        let f = fixture();
        f.router
            .complete(None, RequestRecord::begin("127.0.0.1:5000", "GET"), 404);

        let records = f.sink.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].target.is_none());
    }
}
