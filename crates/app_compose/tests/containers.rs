mod common;

use app_compose::runtime::{ProcessState, Signal};
use common::{orchestrator, within, CountingEngine, RecordingSink};
use std::sync::Arc;

const TWO_CACHES: &str = r#"
apps:
  cache_a:
    image: redis:7
    volumes: ["data:/data"]
  cache_b:
    image: redis:7
    volumes: ["data:/data"]
"#;

#[tokio::test]
async fn test_concurrent_apps_share_one_pull() {
    let engine = Arc::new(CountingEngine::default());
    let mut orchestrator = orchestrator(TWO_CACHES, Arc::default(), engine.clone(), Arc::default());
    let registry = orchestrator.create_processes().unwrap();
    orchestrator.start_processes().unwrap();

    for name in ["cache_a", "cache_b"] {
        within(registry.get(name).unwrap().process.core().wait_until_ready()).await;
    }

    assert_eq!(engine.pulls(), 1);
    assert_eq!(engine.volumes(), 1);
    assert_eq!(engine.creates(), 2);
}

#[tokio::test]
async fn test_pull_progress_reaches_every_waiting_app() {
    let engine = Arc::new(CountingEngine::default());
    let sink = Arc::new(RecordingSink::default());
    let mut orchestrator = orchestrator(TWO_CACHES, Arc::default(), engine.clone(), sink.clone());
    let registry = orchestrator.create_processes().unwrap();
    orchestrator.start_processes().unwrap();

    // One of the waiting apps goes away mid-pull
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let cache_a = registry.get("cache_a").unwrap().process.clone();
    assert!(!cache_a.kill(Signal::Interrupt).await);

    within(registry.get("cache_b").unwrap().process.core().wait_until_ready()).await;
    sink.wait_for("cache_b ... Pulled image redis:7").await;

    assert!(sink.contains("cache_a ... Pulling image redis:7"));
    assert!(sink.contains("cache_b ... Pulling image redis:7"));
    assert!(!sink.contains("cache_a ... Pulled image redis:7"));
    assert_eq!(engine.pulls(), 1);
}

#[tokio::test]
async fn test_exports_see_container_address() {
    let yaml = r#"
apps:
  db:
    image: postgres:16
    ports: ["5432"]
    export:
      DATABASE_URL: "postgres://$IP_ADDRESS:5432/dev"
  api:
    command: api
    depends_on: [db]
"#;
    let engine = Arc::new(CountingEngine::default());
    let spawner = Arc::new(common::ScriptedSpawner::default());
    let mut orchestrator = orchestrator(yaml, spawner.clone(), engine, Arc::default());
    let registry = orchestrator.create_processes().unwrap();
    orchestrator.start_processes().unwrap();

    within(registry.get("api").unwrap().process.core().wait_until_ready()).await;

    // First container created gets 172.17.0.2
    let request = spawner.request("api").unwrap();
    assert_eq!(request.env["DATABASE_URL"], "postgres://172.17.0.2:5432/dev");
    assert!(!request.env.contains_key("IP_ADDRESS"));
}

#[tokio::test]
async fn test_unchanged_container_is_reused() {
    let yaml = r#"
apps:
  cache:
    image: redis:7
    environment: {MAXMEMORY: 64mb}
"#;
    let engine = Arc::new(CountingEngine::default());

    let first_sink = Arc::new(RecordingSink::default());
    let mut first = orchestrator(yaml, Arc::default(), engine.clone(), first_sink);
    let registry = first.create_processes().unwrap();
    first.start_processes().unwrap();
    let cache = registry.get("cache").unwrap().process.clone();
    within(cache.core().wait_until_ready()).await;
    assert!(cache.kill(Signal::Interrupt).await);
    within(cache.core().wait_until_ended()).await;
    first.dispose();

    let sink = Arc::new(RecordingSink::default());
    let mut second = orchestrator(yaml, Arc::default(), engine.clone(), sink.clone());
    let registry = second.create_processes().unwrap();
    second.start_processes().unwrap();
    within(registry.get("cache").unwrap().process.core().wait_until_ready()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(engine.creates(), 1);
    assert_eq!(engine.pulls(), 1);
    assert!(sink.contains("cache ... Re-using container test_cache"));
}

#[tokio::test]
async fn test_changed_options_recreate_container() {
    let engine = Arc::new(CountingEngine::default());
    for memory in ["64mb", "128mb"] {
        let yaml = format!("apps:\n  cache:\n    image: redis:7\n    environment: {{MAXMEMORY: {memory}}}\n");
        let mut orchestrator = orchestrator(&yaml, Arc::default(), engine.clone(), Arc::default());
        let registry = orchestrator.create_processes().unwrap();
        orchestrator.start_processes().unwrap();
        let cache = registry.get("cache").unwrap().process.clone();
        within(cache.core().wait_until_ready()).await;
        cache.kill(Signal::Interrupt).await;
        within(cache.core().wait_until_ended()).await;
    }

    assert_eq!(engine.creates(), 2);
}

#[tokio::test]
async fn test_container_kill_reports_exit_code() {
    let yaml = r#"
apps:
  cache:
    image: redis:7
"#;
    let engine = Arc::new(CountingEngine::default());
    let sink = Arc::new(RecordingSink::default());
    let mut orchestrator = orchestrator(yaml, Arc::default(), engine.clone(), sink.clone());
    let registry = orchestrator.create_processes().unwrap();
    orchestrator.start_processes().unwrap();

    let cache = registry.get("cache").unwrap().process.clone();
    within(cache.core().wait_until_ready()).await;
    assert!(cache.kill(Signal::Terminate).await);
    within(cache.core().wait_until_ended()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(engine.kills(), vec![("test_cache".to_string(), Signal::Terminate)]);
    assert!(sink.contains("cache: container started"));
    assert!(sink.contains("cache ... sending SIGTERM"));
    assert!(sink.contains("cache ... exited with code 130"));
    assert!(!cache.kill(Signal::Kill).await);
}

#[tokio::test]
async fn test_kill_before_attach_abandons_startup() {
    let yaml = r#"
apps:
  cache:
    image: redis:7
"#;
    let engine = Arc::new(CountingEngine::default());
    let mut orchestrator = orchestrator(yaml, Arc::default(), engine.clone(), Arc::default());
    let registry = orchestrator.create_processes().unwrap();
    orchestrator.start_processes().unwrap();

    let cache = registry.get("cache").unwrap().process.clone();
    // Let the start task begin pulling, then cancel it mid-pull
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(!cache.kill(Signal::Interrupt).await);

    assert_eq!(cache.core().state(), ProcessState::Ended);
    assert_eq!(engine.creates(), 0);
}

#[tokio::test]
async fn test_declared_ports_gate_readiness() {
    // Find a free port, then release it until the app should become reachable
    let port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let yaml = format!(
        r#"
apps:
  web:
    image: nginx:1.27
    ports: ["{port}:80"]
    ready:
      wait_for_ports: true
"#
    );
    let engine = Arc::new(CountingEngine::default().with_ip_address("127.0.0.1"));
    let mut orchestrator = orchestrator(&yaml, Arc::default(), engine, Arc::default());
    let registry = orchestrator.create_processes().unwrap();
    orchestrator.start_processes().unwrap();

    let web = registry.get("web").unwrap().process.clone();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(web.core().state(), ProcessState::Started);
    assert!(!web.core().is_ready());

    let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    within(web.core().wait_until_ready()).await;
}
