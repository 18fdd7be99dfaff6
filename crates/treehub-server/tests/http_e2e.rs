//! Client ↔ hub end-to-end tests.
//!
//! These start a real in-process hub on a random port and drive it with
//! the real `Pusher`. No mocks: archives stream over HTTP, the bucket is
//! file-backed, and reports travel the full pipeline on both sides.

use std::fs;
use std::path::Path;
use treehub_push::Pusher;
use treehub_server::TestHub;

const PREFIX: &str = "treehub/lmp";
const FACTORY: &str = "acme";

fn fixture_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("config"), "[core]\nmode=archive-z2\n").unwrap();
    fs::create_dir_all(dir.path().join("objects/ab")).unwrap();
    fs::write(
        dir.path().join("objects/ab/cdef0123456789.filez"),
        b"first object payload",
    )
    .unwrap();
    fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
    fs::write(dir.path().join("refs/heads/main"), "d".repeat(40)).unwrap();
    dir
}

fn repo_size(repo: &Path) -> u64 {
    ["config", "objects/ab/cdef0123456789.filez", "refs/heads/main"]
        .iter()
        .map(|p| fs::metadata(repo.join(p)).unwrap().len())
        .sum()
}

fn push(repo: &Path, hub_url: &str) -> treehub_push::Report {
    let mut pusher = Pusher::new(repo, hub_url, FACTORY).unwrap();
    pusher.run().unwrap();
    pusher.wait().unwrap()
}

#[test]
fn fresh_push_uploads_the_whole_repo() {
    let hub = TestHub::start(PREFIX);
    let repo = fixture_repo();

    let report = push(repo.path(), &hub.url);

    assert_eq!(report.checked, 3);
    assert_eq!(report.sent.files, 3);
    assert_eq!(report.sent.objects, 1);
    assert_eq!(report.sent.bytes, repo_size(repo.path()));
    assert_eq!(report.synced.uploaded, 3);
    assert_eq!(report.synced.synced, 3);
    assert_eq!(report.synced.upload_synced, 3);
    assert_eq!(report.synced.sync_failed, 0);

    // round-trip law: bucket bytes equal the local bytes at derived keys
    for (repo_path, key) in [
        ("config", "treehub/lmp/config"),
        (
            "objects/ab/cdef0123456789.filez",
            "treehub/lmp/ab/cdef0123456789.filez",
        ),
        ("refs/heads/main", "treehub/lmp/refs/heads/main"),
    ] {
        assert_eq!(
            fs::read(repo.path().join(repo_path)).unwrap(),
            fs::read(hub.bucket_dir.join(key)).unwrap(),
            "bucket copy of {repo_path}"
        );
    }
}

#[test]
fn repeated_push_is_a_noop() {
    let hub = TestHub::start(PREFIX);
    let repo = fixture_repo();

    push(repo.path(), &hub.url);
    let report = push(repo.path(), &hub.url);

    assert_eq!(report.checked, 3);
    // empty missing set: the archiver never ran, no PUT was made
    assert_eq!(report.sent, treehub_push::SendReport::default());
    assert_eq!(report.synced.upload_synced, 0);
    assert_eq!(report.synced.sync_failed, 0);
}

#[test]
fn changed_object_is_the_only_thing_resent() {
    let hub = TestHub::start(PREFIX);
    let repo = fixture_repo();
    push(repo.path(), &hub.url);

    fs::write(
        repo.path().join("objects/ab/cdef0123456789.filez"),
        b"replacement object payload",
    )
    .unwrap();
    let report = push(repo.path(), &hub.url);

    assert_eq!(report.checked, 3);
    assert_eq!(report.sent.files, 1);
    assert_eq!(report.sent.objects, 1);
    assert_eq!(report.synced.uploaded, 1);
    assert_eq!(report.synced.upload_synced, 1);
    assert_eq!(report.synced.sync_failed, 0);

    assert_eq!(
        fs::read(hub.bucket_dir.join("treehub/lmp/ab/cdef0123456789.filez")).unwrap(),
        b"replacement object payload"
    );
}

#[test]
fn corrupted_bucket_object_is_repaired() {
    let hub = TestHub::start(PREFIX);
    let repo = fixture_repo();
    push(repo.path(), &hub.url);

    // the bucket holds the key but with different bytes (wrong server CRC)
    let bucket_copy = hub.bucket_dir.join("treehub/lmp/ab/cdef0123456789.filez");
    fs::write(&bucket_copy, b"bitrot").unwrap();

    let report = push(repo.path(), &hub.url);
    assert_eq!(report.synced.upload_synced, 1);
    assert_eq!(report.synced.sync_failed, 0);
    assert_eq!(fs::read(&bucket_copy).unwrap(), b"first object payload");
}

#[test]
fn check_endpoint_returns_a_subset_of_the_batch() {
    let hub = TestHub::start(PREFIX);
    let agent = ureq::Agent::new_with_defaults();
    let url = format!("{}/v1/repos/lmp?factory={FACTORY}", hub.url);

    let body = r#"{"./config":7,"./objects/ab/cd":42}"#;
    let resp = agent
        .get(url.as_str())
        .header("Content-Type", "application/json")
        .force_send_body()
        .send(body)
        .unwrap();
    let missing: std::collections::HashMap<String, u32> =
        serde_json::from_reader(resp.into_body().into_reader()).unwrap();

    // empty bucket: everything is missing, with the request's checksums
    assert_eq!(missing.len(), 2);
    assert_eq!(missing["./config"], 7);
    assert_eq!(missing["./objects/ab/cd"], 42);
}

#[test]
fn malformed_archive_body_is_rejected() {
    let hub = TestHub::start(PREFIX);
    let agent = ureq::Agent::new_with_defaults();
    let url = format!("{}/v1/repos/lmp?factory={FACTORY}", hub.url);

    let garbage = vec![0xC3u8; 4096];
    let result = agent.put(url.as_str()).send(&garbage[..]);
    assert!(matches!(
        result,
        Err(ureq::Error::StatusCode(code)) if code >= 400
    ));
}

#[test]
fn gateway_url_scheme_is_served_too() {
    let hub = TestHub::start(PREFIX);
    let agent = ureq::Agent::new_with_defaults();
    let url = format!("{}/ota/ostreehub/{FACTORY}/v1/repos/lmp", hub.url);

    let resp = agent
        .get(url.as_str())
        .header("Content-Type", "application/json")
        .force_send_body()
        .send(r#"{"./refs/heads/main":1}"#)
        .unwrap();
    let missing: std::collections::HashMap<String, u32> =
        serde_json::from_reader(resp.into_body().into_reader()).unwrap();
    assert_eq!(missing.len(), 1);
}

#[test]
fn health_endpoint_answers() {
    let hub = TestHub::start(PREFIX);
    let agent = ureq::Agent::new_with_defaults();
    let mut resp = agent.get(format!("{}/health", hub.url).as_str()).call().unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.body_mut().read_to_string().unwrap();
    assert!(body.contains("ok"));
}

#[test]
fn push_fails_cleanly_when_the_hub_is_unreachable() {
    let repo = fixture_repo();
    let mut pusher = Pusher::new(repo.path(), "http://127.0.0.1:1", FACTORY).unwrap();
    pusher.run().unwrap();
    assert!(pusher.wait().is_err());
}

#[test]
fn many_object_repo_round_trips() {
    let hub = TestHub::start(PREFIX);
    let repo = fixture_repo();
    for i in 0..40 {
        let sub = repo.path().join(format!("objects/{i:02x}"));
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("payload.filez"), format!("payload number {i}")).unwrap();
    }

    let report = push(repo.path(), &hub.url);
    assert_eq!(report.checked, 43);
    assert_eq!(report.synced.synced, 43);
    assert_eq!(report.synced.sync_failed, 0);

    for i in 0..40 {
        let key = hub
            .bucket_dir
            .join(format!("treehub/lmp/{i:02x}/payload.filez"));
        assert_eq!(
            fs::read(key).unwrap(),
            format!("payload number {i}").into_bytes()
        );
    }

    // and a re-push of the larger repo is still a no-op
    let again = push(repo.path(), &hub.url);
    assert_eq!(again.synced.upload_synced, 0);
}
