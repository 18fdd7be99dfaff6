//! Client half of the treehub sync pipeline.
//!
//! A [`Pusher`] walks a local OSTree-style repository, negotiates with the
//! hub which objects are missing, streams the missing set as a single PAX
//! archive, and aggregates per-batch outcomes into a final [`Report`].
//!
//! The pipeline is built from OS threads connected by bounded channels: a
//! single walker feeds [`PUSH_CONCURRENCY`] batch workers, and three report
//! channels fan in to the collector in [`Pusher::wait`].

pub mod batch;
pub mod creds;
pub mod walker;

pub use creds::{parse_cred_archive, HubCredentials, OAuth2, TreehubInfo};
pub use treehub_core::{Report, SendReport, SyncReport};

use crossbeam_channel::{bounded, Receiver, Select};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Number of concurrent batch workers negotiating with the hub.
pub const PUSH_CONCURRENCY: usize = 20;
/// Capacity of the walker's output queue.
pub const WALK_QUEUE_SIZE: usize = 10_000;
/// Repository name used in the hub request path.
pub const DEFAULT_REPO_NAME: &str = "lmp";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not an ostree repo: {0}")]
    NotARepo(String),
    #[error("credential archive error: {0}")]
    Creds(String),
    #[error("invalid hub URL: {0}")]
    Url(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("malformed hub response: {0}")]
    Protocol(String),
    #[error("archive error: {0}")]
    Archive(#[from] treehub_core::CoreError),
    #[error("a push is already in flight")]
    Busy,
    #[error("no push in flight")]
    NotRunning,
}

/// Cooperative cancellation shared by every pipeline stage. The first
/// stage to fail sets the flag; the others drain and exit.
#[derive(Clone, Default)]
pub(crate) struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The report channels of an in-flight push. Each worker sends its batch
/// size on `check`, then (when an archive was uploaded) exactly one
/// `SendReport` and one `SyncReport`. `errors` carries the first failure
/// of any stage.
pub(crate) struct Status {
    pub check: Receiver<u64>,
    pub send: Receiver<SendReport>,
    pub sync: Receiver<SyncReport>,
    pub errors: Receiver<PushError>,
}

/// Pushes a local repository to a treehub instance.
pub struct Pusher {
    repo: PathBuf,
    url: String,
    auth: Option<OAuth2>,
    token: Option<String>,
    agent: ureq::Agent,
    status: Option<Status>,
}

impl Pusher {
    /// Unauthenticated pusher; the factory travels as a query parameter.
    pub fn new(repo: &Path, hub_url: &str, factory: &str) -> Result<Self, PushError> {
        walker::check_repo_dir(repo)?;
        if hub_url.is_empty() {
            return Err(PushError::Url("hub URL is not specified".to_owned()));
        }
        if factory.is_empty() {
            return Err(PushError::Url("factory name is not specified".to_owned()));
        }
        let url = format!(
            "{}/v1/repos/{DEFAULT_REPO_NAME}?factory={factory}",
            hub_url.trim_end_matches('/')
        );
        url::Url::parse(&url).map_err(|e| PushError::Url(e.to_string()))?;
        Ok(Self {
            repo: repo.to_path_buf(),
            url,
            auth: None,
            token: None,
            agent: ureq::Agent::new_with_defaults(),
            status: None,
        })
    }

    /// Pusher configured from a credential archive; `run` fetches an
    /// OAuth2 token before the pipeline starts.
    pub fn with_credentials(repo: &Path, cred_zip: &Path) -> Result<Self, PushError> {
        walker::check_repo_dir(repo)?;
        let hub = creds::extract_hub(&parse_cred_archive(cred_zip)?)?;
        let url = format!(
            "{}/ota/ostreehub/{}/v1/repos/{DEFAULT_REPO_NAME}",
            hub.url, hub.factory
        );
        url::Url::parse(&url).map_err(|e| PushError::Url(e.to_string()))?;
        Ok(Self {
            repo: repo.to_path_buf(),
            url,
            auth: hub.auth,
            token: None,
            agent: ureq::Agent::new_with_defaults(),
            status: None,
        })
    }

    pub fn hub_url(&self) -> &str {
        &self.url
    }

    /// Start the push pipeline. Returns immediately; progress and the
    /// final outcome are consumed by [`wait`](Self::wait).
    pub fn run(&mut self) -> Result<(), PushError> {
        if self.status.is_some() {
            return Err(PushError::Busy);
        }
        if let Some(auth) = &self.auth {
            let token = creds::fetch_oauth_token(&self.agent, auth)?;
            info!("obtained OAuth2 token from {}", auth.server);
            self.token = Some(token);
        }

        let cancel = CancelFlag::default();
        let (err_tx, err_rx) = bounded(PUSH_CONCURRENCY + 1);
        let files = walker::walk_repo(&self.repo, cancel.clone(), err_tx.clone());
        let status = batch::spawn_workers(batch::WorkerContext {
            agent: self.agent.clone(),
            repo: self.repo.clone(),
            url: self.url.clone(),
            token: self.token.clone(),
            files,
            cancel,
            err_tx,
            err_rx,
        });
        self.status = Some(status);
        Ok(())
    }

    /// Block until the pipeline drains, returning the aggregated report
    /// or the first error any stage recorded.
    pub fn wait(&mut self) -> Result<Report, PushError> {
        let status = self.status.take().ok_or(PushError::NotRunning)?;
        collect(status)
    }
}

/// Collector: multiplexes the three report channels. The check and send
/// channels may close at any point and are simply dropped from the
/// selection; the report is final only once the sync channel closes,
/// which every worker precedes with its last sends on all three.
pub(crate) fn collect(status: Status) -> Result<Report, PushError> {
    let mut report = Report::default();

    let mut sel = Select::new();
    let op_check = sel.recv(&status.check);
    let op_send = sel.recv(&status.send);
    let op_sync = sel.recv(&status.sync);

    'drain: loop {
        let op = sel.select();
        match op.index() {
            i if i == op_check => match op.recv(&status.check) {
                Ok(checked) => {
                    report.checked += checked;
                    debug!("checked: {}", report.checked);
                }
                Err(_) => sel.remove(op_check),
            },
            i if i == op_send => match op.recv(&status.send) {
                Ok(sent) => {
                    report.sent.absorb(&sent);
                    debug!("sent: {} files", report.sent.files);
                }
                Err(_) => sel.remove(op_send),
            },
            i if i == op_sync => match op.recv(&status.sync) {
                Ok(synced) => report.synced.absorb(&synced),
                Err(_) => break 'drain,
            },
            _ => unreachable!("unknown select operation"),
        }
    }

    if let Ok(err) = status.errors.try_recv() {
        return Err(err);
    }
    info!("repo sync has completed");
    Ok(report)
}
