//! End-to-end instance lifecycle against the in-memory engine

use ssm_server::testing::{fixtures, MockEngine, ScriptedProbe, ScriptedSpawner};
use ssm_server::{Catalog, ContainerEngine, Instance, ServerEvent, Status};
use std::sync::Arc;
use std::time::Duration;

fn instance(dir: &std::path::Path, engine: Arc<MockEngine>, probe: ScriptedProbe) -> Instance {
    let ctx = fixtures::context(
        dir,
        engine,
        Arc::new(ScriptedSpawner::new()),
        Arc::new(probe),
        Arc::new(Catalog::from_parts([fixtures::game("minecraft")], [])),
    );
    Instance::new(ctx, fixtures::record("alice", 25565)).unwrap()
}

async fn wait_for(instance: &Instance, status: Status) {
    for _ in 0..300 {
        if instance.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never became {:?}, is {:?}", status, instance.status());
}

#[tokio::test]
async fn test_create_install_start_stop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let instance = instance(dir.path(), engine.clone(), ScriptedProbe::healthy());

    instance.create("hunter2").await.unwrap();
    instance.install().await.unwrap();
    assert!(instance.is_installed());

    instance.start().await.unwrap();
    assert_eq!(instance.status(), Status::Starting);

    engine.emit_output("alice", "\u{1b}[32mDone (3.1s)!\u{1b}[0m\n");
    wait_for(&instance, Status::Running).await;

    instance.stop().await.unwrap();
    engine.stop("alice").await.unwrap();
    wait_for(&instance, Status::Off).await;

    let snapshot = instance.snapshot();
    assert!(snapshot.installed);
    assert!(!snapshot.blocked);
    instance.shutdown().await;
}

#[tokio::test]
async fn test_console_lines_are_stripped_of_ansi() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let instance = instance(dir.path(), engine.clone(), ScriptedProbe::healthy());
    instance.create("pw").await.unwrap();
    let mut rx = instance.events().receiver();

    instance.start().await.unwrap();
    engine.emit_output("alice", "\u{1b}[1mready\u{1b}[0m\n");
    wait_for(&instance, Status::Running).await;

    let mut console = Vec::new();
    while let Ok(record) = rx.try_recv() {
        if let ServerEvent::Console(line) = record.payload {
            console.push(line);
        }
    }
    assert_eq!(console, vec!["ready\n".to_string()]);
    instance.kill().await.unwrap();
    instance.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_server_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let instance = instance(dir.path(), engine.clone(), ScriptedProbe::failing());
    instance.create("pw").await.unwrap();
    let mut rx = instance.events().receiver();

    instance.start().await.unwrap();
    engine.emit_output("alice", "Done!\n");
    wait_for(&instance, Status::Running).await;

    // pingTime is 50ms in the fixture config; three misses end the server
    let crash = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    if let ServerEvent::Announcement(text) = record.payload {
                        if text.contains("not responding") {
                            return text;
                        }
                    }
                }
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("no crash announcement");
    assert_eq!(
        crash,
        "Your server has been killed due to the server not responding."
    );

    wait_for(&instance, Status::Off).await;
    assert!(!engine.is_running_now("alice"));
    assert_eq!(engine.count("stop"), 1);
}
