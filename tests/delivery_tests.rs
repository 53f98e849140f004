// SPDX-License-Identifier: Apache-2.0

//! End to end delivery through the agent: files on disk, a recording sink,
//! and the registry file left behind.

mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use common::{RecordingSink, fast_agent, wait_for};
use efsbeat::init::agent::Agent;
use efsbeat::init::args::AgentRun;
use efsbeat::registry::ReadState;
use efsbeat::{BoxError, FileId, Registry};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn start(run: AgentRun, sink: RecordingSink) -> (CancellationToken, JoinHandle<Result<(), BoxError>>) {
    let cancel = CancellationToken::new();
    let agent = Agent::new(Box::new(run));
    let handle = tokio::spawn(agent.run_with_sink(sink, cancel.clone()));
    (cancel, handle)
}

fn committed(registry_path: &Path, file: &Path) -> Option<ReadState> {
    let registry = Registry::open(registry_path).unwrap();
    registry.get(&FileId::from_path(file).unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_lines_are_delivered_and_committed() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.log");
    fs::write(&file, "line1\nline2\n").unwrap();

    let run = fast_agent(dir.path());
    let registry_path = run.registry_path.clone();
    let sink = RecordingSink::default();
    let (cancel, handle) = start(run, sink.clone());

    wait_for(TEST_TIMEOUT, || sink.delivered().len() == 2).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.payloads(), vec!["line1", "line2"]);
    let events = sink.delivered();
    assert_eq!(events[0].offset_range, 0..6);
    assert_eq!(events[1].offset_range, 6..12);

    let state = committed(&registry_path, &file).unwrap();
    assert_eq!(state.offset, 12);
    assert_eq!(state.generation, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_batch_is_resent_until_accepted() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.log");
    fs::write(&file, "line1\nline2\n").unwrap();

    let run = fast_agent(dir.path());
    let registry_path = run.registry_path.clone();
    let sink = RecordingSink::failing_first(2);
    let (cancel, handle) = start(run, sink.clone());

    wait_for(TEST_TIMEOUT, || sink.delivered().len() == 2).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let attempts = sink.attempts();
    assert!(attempts.len() >= 3);
    assert_eq!(attempts[0], attempts[1]);
    assert_eq!(attempts[1], attempts[2]);
    assert_eq!(sink.payloads(), vec!["line1", "line2"]);

    assert_eq!(committed(&registry_path, &file).unwrap().offset, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_from_committed_offset() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("app.log");
    fs::write(&file, "line1\nline2\n").unwrap();

    // Nothing gets through, so nothing may be committed
    let refusing = RecordingSink::failing_first(u32::MAX);
    let (cancel, handle) = start(fast_agent(dir.path()), refusing.clone());
    wait_for(TEST_TIMEOUT, || refusing.attempts().len() >= 2).await;
    cancel.cancel();
    let _ = handle.await.unwrap();

    let registry_path = fast_agent(dir.path()).registry_path;
    let offset = committed(&registry_path, &file).map(|s| s.offset);
    assert!(matches!(offset, None | Some(0)));

    // Everything is replayed
    let sink = RecordingSink::default();
    let (cancel, handle) = start(fast_agent(dir.path()), sink.clone());
    wait_for(TEST_TIMEOUT, || sink.delivered().len() == 2).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(sink.payloads(), vec!["line1", "line2"]);

    // Only new lines after another restart
    OpenOptions::new()
        .append(true)
        .open(&file)
        .unwrap()
        .write_all(b"line3\n")
        .unwrap();

    let sink = RecordingSink::default();
    let (cancel, handle) = start(fast_agent(dir.path()), sink.clone());
    wait_for(TEST_TIMEOUT, || !sink.delivered().is_empty()).await;
    // Give a stray replay the chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.payloads(), vec!["line3"]);
    assert_eq!(committed(&registry_path, &file).unwrap().offset, 18);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncation_starts_a_new_generation() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("app.log");
    fs::write(&file, "aaaa\nbbbb\n").unwrap();

    let run = fast_agent(dir.path());
    let registry_path = run.registry_path.clone();
    let sink = RecordingSink::default();
    let (cancel, handle) = start(run, sink.clone());

    wait_for(TEST_TIMEOUT, || sink.delivered().len() == 2).await;

    // Same inode, shorter content
    fs::write(&file, "c\n").unwrap();

    wait_for(TEST_TIMEOUT, || sink.payloads().iter().any(|p| p == "c")).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let events = sink.delivered();
    let last = events.last().unwrap();
    assert_eq!(last.generation, 1);
    assert_eq!(last.offset_range, 0..2);

    let state = committed(&registry_path, &file).unwrap();
    assert_eq!(state.generation, 1);
    assert_eq!(state.offset, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lines_of_many_files_stay_in_order() {
    let dir = TempDir::new().unwrap();
    let mut expected = Vec::new();
    for f in 0..3 {
        let mut content = String::new();
        for i in 0..50 {
            content.push_str(&format!("file{}-{}\n", f, i));
        }
        fs::write(dir.path().join(format!("f{}.log", f)), content).unwrap();
        expected.push(f);
    }

    let sink = RecordingSink::default();
    let (cancel, handle) = start(fast_agent(dir.path()), sink.clone());
    wait_for(TEST_TIMEOUT, || sink.delivered().len() == 150).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    for f in expected {
        let prefix = format!("file{}-", f);
        let lines: Vec<String> = sink
            .payloads()
            .into_iter()
            .filter(|p| p.starts_with(&prefix))
            .collect();
        let want: Vec<String> = (0..50).map(|i| format!("{}{}", prefix, i)).collect();
        assert_eq!(lines, want);
    }
}
