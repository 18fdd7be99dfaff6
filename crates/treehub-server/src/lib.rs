//! treehub hub: HTTP surface over the check and ingest pipelines.
//!
//! Routes (both URL schemes the clients use are accepted):
//! - `GET /v1/repos/<repo>?factory=<f>` — negotiation. The batch arrives
//!   as a JSON body on a GET request; that shape is the existing wire
//!   contract, so middleware in front of the hub must not strip bodies.
//! - `PUT /v1/repos/<repo>` — chunked PAX archive ingest, answered with a
//!   JSON `SyncReport`.
//! - `/ota/ostreehub/<factory>/v1/repos/<repo>` — same endpoints as seen
//!   through the credential-flow gateway path.
//! - `GET /health`.
//!
//! The [`TestHub`] helper starts a hub on a random port backed by a
//! temporary file bucket for integration testing.

pub mod bucket;
pub mod check;
pub mod ingest;

pub use bucket::{Bucket, BucketError, FsBucket, ObjectAttrs};
pub use check::missing_set;
pub use ingest::ingest_archive;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info};
use treehub_core::{CoreError, FileBatch};

/// Default size of the worker pool shared by the check and upload stages.
pub const DEFAULT_WORKERS: usize = 10;
/// Threads accepting and handling HTTP requests.
const HANDLER_THREADS: usize = 8;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] CoreError),
    #[error("invalid request body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Hub configuration fixed at startup.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Key prefix every bucket object lands under.
    pub object_prefix: String,
    /// Directory receiving per-request staging subdirectories.
    pub staging_root: PathBuf,
    /// Worker-pool size for both bucket checks and uploads.
    pub workers: usize,
}

pub struct Hub {
    bucket: Arc<dyn Bucket>,
    config: HubConfig,
}

/// A parsed repo route: the repo name plus the factory carried either as
/// a query parameter or as a path segment of the gateway scheme.
#[derive(Debug, PartialEq, Eq)]
pub struct RepoRoute {
    pub repo: String,
    pub factory: Option<String>,
}

/// Parse both request-path schemes into a [`RepoRoute`].
pub fn parse_repo_route(url: &str) -> Option<RepoRoute> {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };

    let factory_from_query = query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("factory="))
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
    });

    if let Some(repo) = path.strip_prefix("/v1/repos/") {
        if repo.is_empty() || repo.contains('/') {
            return None;
        }
        return Some(RepoRoute {
            repo: repo.to_owned(),
            factory: factory_from_query,
        });
    }

    // gateway scheme: /ota/ostreehub/<factory>/v1/repos/<repo>
    let rest = path.strip_prefix("/ota/ostreehub/")?;
    let (factory, tail) = rest.split_once('/')?;
    let repo = tail.strip_prefix("v1/repos/")?;
    if factory.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some(RepoRoute {
        repo: repo.to_owned(),
        factory: Some(factory.to_owned()),
    })
}

impl Hub {
    pub fn new(bucket: Arc<dyn Bucket>, config: HubConfig) -> Self {
        Self { bucket, config }
    }

    /// Handle a single HTTP request, dispatching to the appropriate
    /// route handler.
    pub fn handle_request(&self, req: Request) {
        let method = req.method().clone();
        let url = req.url().to_owned();
        debug!("{method} {url}");

        if let Some(route) = parse_repo_route(&url) {
            match method {
                Method::Get => self.handle_check(req, &route),
                Method::Put => self.handle_ingest(req, &route),
                _ => respond_err(req, 405, "method not allowed"),
            }
        } else if url == "/health" && method == Method::Get {
            let _ = req.respond(Response::from_string(r#"{"status":"ok"}"#));
        } else {
            respond_err(req, 404, "not found");
        }
    }

    fn handle_check(&self, mut req: Request, route: &RepoRoute) {
        let mut body = Vec::new();
        if req.as_reader().read_to_end(&mut body).is_err() {
            respond_err(req, 500, "read error");
            return;
        }
        let batch: FileBatch = match serde_json::from_slice(&body) {
            Ok(batch) => batch,
            Err(e) => {
                respond_err(req, 400, &format!("invalid batch: {e}"));
                return;
            }
        };

        info!(
            "check: {} files, repo '{}', factory {:?}",
            batch.len(),
            route.repo,
            route.factory
        );
        let missing = check::missing_set(
            self.bucket.as_ref(),
            &self.config.object_prefix,
            &batch,
            self.config.workers,
        );
        match serde_json::to_vec(&missing) {
            Ok(json) => respond_json(req, json),
            Err(e) => respond_err(req, 500, &format!("encode error: {e}")),
        }
    }

    fn handle_ingest(&self, mut req: Request, route: &RepoRoute) {
        info!("ingest: repo '{}', factory {:?}", route.repo, route.factory);
        let result = ingest::ingest_archive(
            self.bucket.as_ref(),
            &self.config.object_prefix,
            &self.config.staging_root,
            req.as_reader(),
            self.config.workers,
        );
        match result {
            Ok(report) => match serde_json::to_vec(&report) {
                Ok(json) => respond_json(req, json),
                Err(e) => respond_err(req, 500, &format!("encode error: {e}")),
            },
            Err(err @ HubError::Archive(_)) => {
                error!("ingest aborted: {err}");
                respond_err(req, 400, &err.to_string());
            }
            Err(err) => {
                error!("ingest failed: {err}");
                respond_err(req, 500, &err.to_string());
            }
        }
    }
}

fn respond_err(req: Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: Request, json: Vec<u8>) {
    let header = Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let _ = req.respond(Response::from_data(json).with_header(header));
}

/// Start the hub's accept loop, blocking the current thread.
pub fn run_server(hub: &Arc<Hub>, addr: &str) {
    let server = Arc::new(Server::http(addr).expect("failed to bind HTTP server"));
    serve_on(hub, &server);
}

fn serve_on(hub: &Arc<Hub>, server: &Arc<Server>) {
    let handles: Vec<_> = (0..HANDLER_THREADS)
        .map(|_| {
            let server = Arc::clone(server);
            let hub = Arc::clone(hub);
            std::thread::spawn(move || {
                while let Ok(req) = server.recv() {
                    hub.handle_request(req);
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
}

/// A test helper that starts a hub on a random port in background
/// threads, backed by a temporary file bucket and staging area.
///
/// Drop the `TestHub` to stop the server.
pub struct TestHub {
    pub url: String,
    pub port: u16,
    pub bucket_dir: PathBuf,
    _bucket_tmp: tempfile::TempDir,
    _staging_tmp: tempfile::TempDir,
    _server: Arc<Server>,
}

impl TestHub {
    /// Start a test hub writing objects under `object_prefix`.
    pub fn start(object_prefix: &str) -> Self {
        let bucket_tmp = tempfile::tempdir().expect("failed to create bucket dir");
        let staging_tmp = tempfile::tempdir().expect("failed to create staging dir");
        let bucket_dir = bucket_tmp.path().to_path_buf();

        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let hub = Arc::new(Hub::new(
            Arc::new(FsBucket::new(&bucket_dir)),
            HubConfig {
                object_prefix: object_prefix.to_owned(),
                staging_root: staging_tmp.path().to_path_buf(),
                workers: DEFAULT_WORKERS,
            },
        ));
        for _ in 0..HANDLER_THREADS {
            let server = Arc::clone(&server);
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                while let Ok(req) = server.recv() {
                    hub.handle_request(req);
                }
            });
        }

        Self {
            url,
            port,
            bucket_dir,
            _bucket_tmp: bucket_tmp,
            _staging_tmp: staging_tmp,
            _server: server,
        }
    }
}
