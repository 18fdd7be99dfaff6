//! Batch workers: negotiate each batch with the hub, then stream the
//! missing set as a single chunked PUT.
//!
//! Each worker drains the walker queue into a batch, `GET`s it as a JSON
//! body against the check endpoint (GET-with-body is the existing wire
//! contract; middleware must not strip it), and — when the hub reports
//! missing files — uploads a PAX archive while an archiver thread feeds
//! the request body through a bounded pipe. Within one worker the stages
//! are strictly sequential: check, archive, then exactly one send report
//! and one sync report.

use crate::{CancelFlag, PushError, Status, PUSH_CONCURRENCY};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;
use treehub_core::{
    bounded_pipe, pack_repo, CoreError, FileBatch, RepoFile, SendReport, SyncReport, BATCH_MAX,
};
use tracing::debug;

pub(crate) struct WorkerContext {
    pub agent: ureq::Agent,
    pub repo: PathBuf,
    pub url: String,
    pub token: Option<String>,
    pub files: Receiver<RepoFile>,
    pub cancel: CancelFlag,
    pub err_tx: Sender<PushError>,
    pub err_rx: Receiver<PushError>,
}

/// Spawn the batch worker pool. The report channels close once every
/// worker has exited, which is what lets the collector terminate.
pub(crate) fn spawn_workers(ctx: WorkerContext) -> Status {
    let (check_tx, check_rx) = bounded(PUSH_CONCURRENCY);
    let (send_tx, send_rx) = bounded(PUSH_CONCURRENCY);
    let (sync_tx, sync_rx) = bounded(PUSH_CONCURRENCY);

    for _ in 0..PUSH_CONCURRENCY {
        let worker = Worker {
            agent: ctx.agent.clone(),
            repo: ctx.repo.clone(),
            url: ctx.url.clone(),
            token: ctx.token.clone(),
            files: ctx.files.clone(),
            cancel: ctx.cancel.clone(),
            check_tx: check_tx.clone(),
            send_tx: send_tx.clone(),
            sync_tx: sync_tx.clone(),
            err_tx: ctx.err_tx.clone(),
        };
        thread::spawn(move || worker.run());
    }

    Status {
        check: check_rx,
        send: send_rx,
        sync: sync_rx,
        errors: ctx.err_rx,
    }
}

struct Worker {
    agent: ureq::Agent,
    repo: PathBuf,
    url: String,
    token: Option<String>,
    files: Receiver<RepoFile>,
    cancel: CancelFlag,
    check_tx: Sender<u64>,
    send_tx: Sender<SendReport>,
    sync_tx: Sender<SyncReport>,
    err_tx: Sender<PushError>,
}

impl Worker {
    fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let batch = fill_batch(&self.files);
            if batch.is_empty() {
                return;
            }
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.push_batch(&batch) {
                self.cancel.cancel();
                let _ = self.err_tx.send(err);
                return;
            }
        }
    }

    fn push_batch(&self, batch: &FileBatch) -> Result<(), PushError> {
        let missing = self.check_batch(batch)?;
        let _ = self.check_tx.send(batch.len() as u64);

        if missing.is_empty() {
            return Ok(());
        }
        let (sent, synced) = self.send_archive(missing)?;
        let _ = self.send_tx.send(sent);
        let _ = self.sync_tx.send(synced);
        Ok(())
    }

    fn check_batch(&self, batch: &FileBatch) -> Result<FileBatch, PushError> {
        let body =
            serde_json::to_vec(batch).map_err(|e| PushError::Protocol(e.to_string()))?;
        debug!("checking {} files", batch.len());

        let mut req = self
            .agent
            .get(self.url.as_str())
            .header("Content-Type", "application/json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req
            .force_send_body()
            .send(&body[..])
            .map_err(|e| PushError::Http(e.to_string()))?;

        serde_json::from_reader(resp.into_body().into_reader())
            .map_err(|e| PushError::Protocol(format!("invalid missing-set response: {e}")))
    }

    fn send_archive(&self, missing: FileBatch) -> Result<(SendReport, SyncReport), PushError> {
        debug!("uploading archive of {} files", missing.len());
        let (writer, reader) = bounded_pipe();
        // archive side-channel: exactly one report per upload
        let (report_tx, report_rx) = bounded(1);
        let repo = self.repo.clone();
        let archiver = thread::spawn(move || match pack_repo(&repo, &missing, writer) {
            Ok(report) => {
                let _ = report_tx.send(report);
                Ok(())
            }
            Err(err) => Err(err),
        });

        let mut req = self
            .agent
            .put(self.url.as_str())
            .header("Expect", "100-continue");
        if let Some(token) = &self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let response = req.send(ureq::SendBody::from_owned_reader(reader));

        let packed = archiver
            .join()
            .map_err(|_| PushError::Protocol("archiver thread panicked".to_owned()))?;

        let resp = match (packed, response) {
            // a local read/write failure explains the aborted request
            (Err(err), Err(_)) if !is_broken_pipe(&err) => return Err(err.into()),
            (_, Err(e)) => return Err(PushError::Http(e.to_string())),
            (Err(err), Ok(_)) => return Err(err.into()),
            (Ok(()), Ok(resp)) => resp,
        };

        let synced: SyncReport = serde_json::from_reader(resp.into_body().into_reader())
            .map_err(|e| PushError::Protocol(format!("invalid sync report: {e}")))?;
        let sent = report_rx
            .try_recv()
            .map_err(|_| PushError::Protocol("archiver produced no send report".to_owned()))?;
        Ok((sent, synced))
    }
}

/// A writer-side pipe failure caused by the HTTP layer dropping the body.
fn is_broken_pipe(err: &CoreError) -> bool {
    matches!(err, CoreError::Io(e) if e.kind() == ErrorKind::BrokenPipe)
}

/// Drain the walker queue into one batch. A worker may take one file past
/// `BATCH_MAX` before cutting the batch, matching the original wire
/// behavior; an empty result means the queue closed.
pub(crate) fn fill_batch(files: &Receiver<RepoFile>) -> FileBatch {
    let mut batch = FileBatch::new();
    while let Ok(file) = files.recv() {
        batch.insert(file.path, file.checksum);
        if batch.len() > BATCH_MAX {
            break;
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fill_batch_takes_one_past_the_maximum() {
        let (tx, rx) = bounded(2 * BATCH_MAX);
        for i in 0..(BATCH_MAX + 2) {
            tx.send(RepoFile::new(format!("./objects/{i}"), i as u32))
                .unwrap();
        }
        drop(tx);

        let first = fill_batch(&rx);
        assert_eq!(first.len(), BATCH_MAX + 1);
        let second = fill_batch(&rx);
        assert_eq!(second.len(), 1);
        assert!(fill_batch(&rx).is_empty());
    }

    #[test]
    fn fill_batch_returns_partial_batch_on_closure() {
        let (tx, rx) = bounded(16);
        for i in 0..3 {
            tx.send(RepoFile::new(format!("./refs/{i}"), i)).unwrap();
        }
        drop(tx);
        assert_eq!(fill_batch(&rx).len(), 3);
    }

    /// A captured check request for wire-shape assertions.
    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    /// One-shot mock hub answering the check endpoint with `response`.
    fn mock_check_server(
        response: &'static str,
    ) -> (String, Arc<Mutex<Option<CapturedRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let captured: Arc<Mutex<Option<CapturedRequest>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&captured);
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let method = request_line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_owned();

            let mut headers = HashMap::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                    break;
                }
                if let Some((k, v)) = line.trim().split_once(": ") {
                    if k.eq_ignore_ascii_case("content-length") {
                        content_length = v.parse().unwrap_or(0);
                    }
                    headers.insert(k.to_lowercase(), v.to_owned());
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            *slot.lock().unwrap() = Some(CapturedRequest {
                method,
                headers,
                body,
            });

            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response}",
                response.len()
            );
            stream.write_all(reply.as_bytes()).unwrap();
            stream.flush().unwrap();
        });

        (url, captured)
    }

    fn test_worker(url: String, token: Option<String>) -> (Worker, Receiver<u64>) {
        let (check_tx, check_rx) = bounded(4);
        let (send_tx, _send_rx) = bounded(4);
        let (sync_tx, _sync_rx) = bounded(4);
        let (err_tx, _err_rx) = bounded(4);
        let (_files_tx, files) = bounded::<RepoFile>(1);
        (
            Worker {
                agent: ureq::Agent::new_with_defaults(),
                repo: PathBuf::from("."),
                url,
                token,
                files,
                cancel: CancelFlag::default(),
                check_tx,
                send_tx,
                sync_tx,
                err_tx,
            },
            check_rx,
        )
    }

    #[test]
    fn check_is_a_get_with_json_body_and_bearer_header() {
        let (url, captured) = mock_check_server(r#"{"./config":7}"#);
        let (worker, _check_rx) = test_worker(url, Some("secret-token".to_owned()));

        let mut batch = FileBatch::new();
        batch.insert("./config".to_owned(), 7);
        batch.insert("./objects/ab/cd".to_owned(), 42);

        let missing = worker.check_batch(&batch).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing["./config"], 7);

        let req = captured.lock().unwrap().clone().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(
            req.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(
            req.headers.get("authorization").map(String::as_str),
            Some("Bearer secret-token")
        );
        let sent: FileBatch = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(sent, batch);
    }

    #[test]
    fn check_without_token_omits_the_auth_header() {
        let (url, captured) = mock_check_server("{}");
        let (worker, _check_rx) = test_worker(url, None);

        let mut batch = FileBatch::new();
        batch.insert("./refs/heads/main".to_owned(), 1);
        let missing = worker.check_batch(&batch).unwrap();
        assert!(missing.is_empty());

        let req = captured.lock().unwrap().clone().unwrap();
        assert!(!req.headers.contains_key("authorization"));
    }

    #[test]
    fn malformed_check_response_is_a_protocol_error() {
        let (url, _captured) = mock_check_server("not json at all");
        let (worker, _check_rx) = test_worker(url, None);

        let mut batch = FileBatch::new();
        batch.insert("./config".to_owned(), 1);
        assert!(matches!(
            worker.check_batch(&batch),
            Err(PushError::Protocol(_))
        ));
    }

    #[test]
    fn unreachable_hub_is_an_http_error() {
        let (worker, _check_rx) = test_worker("http://127.0.0.1:1".to_owned(), None);
        let mut batch = FileBatch::new();
        batch.insert("./config".to_owned(), 1);
        assert!(matches!(
            worker.check_batch(&batch),
            Err(PushError::Http(_))
        ));
    }
}
