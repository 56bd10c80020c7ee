//! End-to-end reconciliation cycles against mock collaborators: control
//! plane, VCS and container runtime are all in-memory; the state store is a
//! real SQLite database.

mod support;

use buildvigil_agent::api::{ControlPlane, DesiredState, Service};
use buildvigil_agent::deploy::{DeployTimeouts, Deployer};
use buildvigil_agent::docker::ContainerRuntime;
use buildvigil_agent::lifecycle::LifecycleMap;
use buildvigil_agent::proxy::Router;
use buildvigil_agent::state::ProcessStatus;
use buildvigil_agent::vcs::Vcs;
use buildvigil_agent::{Config, PortAllocator, Reconciler, SecretStore, StateStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::{MockControlPlane, MockRuntime, MockVcs};

struct Harness {
    reconciler: Reconciler,
    runtime: Arc<MockRuntime>,
    vcs: Arc<MockVcs>,
    api: Arc<MockControlPlane>,
    state: Arc<StateStore>,
    ports: Arc<PortAllocator>,
    dir: tempfile::TempDir,
}

fn fast_timeouts() -> DeployTimeouts {
    DeployTimeouts {
        health_check_timeout: Duration::from_millis(400),
        health_check_interval: Duration::from_millis(50),
        health_probe_timeout: Duration::from_millis(100),
        connection_drain: Duration::from_millis(10),
    }
}

async fn harness(port_start: u16, port_end: u16, desired: DesiredState) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::open_in_memory().await.unwrap());
    let secrets = Arc::new(SecretStore::new(dir.path().join("secrets"), "agent-test").unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let ports = Arc::new(PortAllocator::new(port_start, port_end));
    let lifecycle = LifecycleMap::new();

    let deployer = Arc::new(
        Deployer::new(
            dir.path().join("repos"),
            state.clone(),
            secrets,
            runtime.clone() as Arc<dyn ContainerRuntime>,
            ports.clone(),
            lifecycle.clone(),
            1000,
        )
        .with_timeouts(fast_timeouts()),
    );

    let vcs = Arc::new(MockVcs::new());
    let api = Arc::new(MockControlPlane::new(desired));

    let config = Config {
        agent_id: "agent-test".to_string(),
        stack_id: "stack-1".to_string(),
        data_dir: dir.path().to_path_buf(),
        port_range_start: port_start,
        port_range_end: port_end,
        ..Config::default()
    };

    let reconciler = Reconciler::new(
        config,
        state.clone(),
        vcs.clone() as Arc<dyn Vcs>,
        deployer,
        Router::new(),
        api.clone() as Arc<dyn ControlPlane>,
        lifecycle,
        None,
        false,
    );

    Harness {
        reconciler,
        runtime,
        vcs,
        api,
        state,
        ports,
        dir,
    }
}

fn seed_repo(h: &Harness, service_id: &str) {
    let repo = h.dir.path().join("repos").join(service_id);
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("Dockerfile"), "FROM alpine\n").unwrap();
}

fn svc(id: &str, name: &str, hostname: &str) -> Service {
    Service {
        id: id.to_string(),
        name: name.to_string(),
        git_url: "https://example.com/repo.git".to_string(),
        hostname: hostname.to_string(),
        docker_container_port: 8000,
        ..Default::default()
    }
}

fn desired(version: u64, hash: &str, services: Vec<Service>) -> DesiredState {
    DesiredState {
        stack_id: "stack-1".to_string(),
        version,
        hash: hash.to_string(),
        poll_interval: 30,
        heartbeat_interval: 45,
        security_mode: "none".to_string(),
        external_proxy_port: 8080,
        services,
    }
}

#[tokio::test]
async fn cold_start_deploys_routes_and_records_applied_state() {
    let h = harness(
        47000,
        47010,
        desired(3, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");

    let report = h.reconciler.sync().await.unwrap();
    assert!(!report.had_errors);

    let pair = h.ports.get("svc-1").unwrap();
    assert!(h.runtime.container("buildvigil-svc-1").is_some());
    assert_eq!(
        h.reconciler.router().external_port_for("api.example.com"),
        Some(pair.blue_port)
    );
    assert_eq!(
        h.reconciler.router().internal_port_for("api"),
        Some(pair.blue_port)
    );

    let applied = h.state.get_applied_state().await.unwrap().unwrap();
    assert_eq!(applied.stack_version, 3);
    assert_eq!(applied.state_hash, "h1");
}

#[tokio::test]
async fn unchanged_hash_with_running_service_is_a_noop_cycle() {
    let h = harness(
        47020,
        47030,
        desired(3, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");
    h.reconciler.sync().await.unwrap();

    h.runtime.events.lock().clear();
    let report = h.reconciler.sync().await.unwrap();
    assert!(!report.had_errors);

    // No builds, runs or stops: the service was already converged.
    let events = h.runtime.events();
    assert!(
        events.iter().all(|e| !e.starts_with("build:") && !e.starts_with("run:")),
        "unexpected container churn: {:?}",
        events
    );
}

#[tokio::test]
async fn commit_change_triggers_blue_green_redeploy() {
    let h = harness(
        47040,
        47050,
        desired(3, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");
    h.reconciler.sync().await.unwrap();
    let pair = h.ports.get("svc-1").unwrap();

    h.vcs.set_commit("svc-1", "c2");
    h.api
        .set_desired(desired(4, "h2", vec![svc("svc-1", "api", "api.example.com")]));
    let report = h.reconciler.sync().await.unwrap();
    assert!(!report.had_errors);

    // Traffic now points at the green port and state advanced.
    assert_eq!(
        h.reconciler.router().external_port_for("api.example.com"),
        Some(pair.green_port)
    );
    let process = h.state.get_service_process("svc-1").await.unwrap().unwrap();
    assert_eq!(process.git_commit, "c2");
    let applied = h.state.get_applied_state().await.unwrap().unwrap();
    assert_eq!(applied.state_hash, "h2");
}

#[tokio::test]
async fn removed_service_is_torn_down_completely() {
    let h = harness(
        47060,
        47070,
        desired(3, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");
    h.reconciler.sync().await.unwrap();
    assert!(h.runtime.container("buildvigil-svc-1").is_some());

    h.api.set_desired(desired(4, "h2", vec![]));
    let report = h.reconciler.sync().await.unwrap();
    assert!(!report.had_errors);

    assert!(h.runtime.container("buildvigil-svc-1").is_none());
    assert!(h.state.get_service_process("svc-1").await.unwrap().is_none());
    assert_eq!(h.vcs.removed(), vec!["svc-1".to_string()]);
    assert_eq!(
        h.reconciler.router().external_port_for("api.example.com"),
        None
    );
    assert_eq!(h.reconciler.router().internal_port_for("api"), None);

    let applied = h.state.get_applied_state().await.unwrap().unwrap();
    assert_eq!(applied.state_hash, "h2");
}

#[tokio::test]
async fn per_service_failure_blocks_applied_state_but_not_other_services() {
    // Room for exactly one pair; the second service must fail on allocation.
    let h = harness(
        47080,
        47081,
        desired(
            3,
            "h1",
            vec![
                svc("svc-1", "api", "api.example.com"),
                svc("svc-2", "worker", ""),
            ],
        ),
    )
    .await;
    seed_repo(&h, "svc-1");
    seed_repo(&h, "svc-2");
    h.vcs.set_commit("svc-1", "c1");
    h.vcs.set_commit("svc-2", "c1");

    let report = h.reconciler.sync().await.unwrap();
    assert!(report.had_errors);

    // First service deployed and routed.
    assert!(h.runtime.container("buildvigil-svc-1").is_some());
    assert!(h
        .reconciler
        .router()
        .external_port_for("api.example.com")
        .is_some());

    // Applied state must NOT advance on a cycle with errors.
    assert!(h.state.get_applied_state().await.unwrap().is_none());

    // The failed service carries its error in persisted state.
    let process = h.state.get_service_process("svc-2").await.unwrap().unwrap();
    assert_eq!(process.status, ProcessStatus::Error);
    assert!(process
        .last_error
        .as_deref()
        .unwrap()
        .contains("no available port pairs"));
}

#[tokio::test]
async fn vcs_failure_marks_lifecycle_error_and_blocks_applied_state() {
    let h = harness(
        47090,
        47100,
        desired(3, "h1", vec![svc("svc-1", "api", "")]),
    )
    .await;
    h.vcs.fail.store(true, Ordering::SeqCst);

    let report = h.reconciler.sync().await.unwrap();
    assert!(report.had_errors);
    assert!(h.state.get_applied_state().await.unwrap().is_none());

    // Next tick with a working VCS converges.
    h.vcs.fail.store(false, Ordering::SeqCst);
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");
    let report = h.reconciler.sync().await.unwrap();
    assert!(!report.had_errors);
    assert_eq!(
        h.state.get_applied_state().await.unwrap().unwrap().state_hash,
        "h1"
    );
}

#[tokio::test]
async fn fetch_failure_leaves_routes_and_state_untouched() {
    let h = harness(
        47110,
        47120,
        desired(3, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");
    h.reconciler.sync().await.unwrap();
    let routes_before = h.reconciler.router().external_routes();

    h.api.fail_fetch.store(true, Ordering::SeqCst);
    assert!(h.reconciler.sync().await.is_err());

    assert_eq!(h.reconciler.router().external_routes(), routes_before);
    assert!(h.runtime.container("buildvigil-svc-1").is_some());
}

#[tokio::test]
async fn heartbeat_interval_is_clamped_and_change_detected() {
    let mut state = desired(3, "h1", vec![]);
    state.heartbeat_interval = 10; // below the floor
    let h = harness(47130, 47140, state).await;

    let report = h.reconciler.sync().await.unwrap();
    assert_eq!(report.heartbeat_secs, 30);

    let mut next = desired(4, "h2", vec![]);
    next.heartbeat_interval = 120;
    h.api.set_desired(next);
    let report = h.reconciler.sync().await.unwrap();
    assert_eq!(report.heartbeat_secs, 120);

    let mut next = desired(5, "h3", vec![]);
    next.heartbeat_interval = 100_000; // above the ceiling
    h.api.set_desired(next);
    let report = h.reconciler.sync().await.unwrap();
    assert_eq!(report.heartbeat_secs, 300);
}

#[tokio::test]
async fn heartbeat_reports_service_status_and_stack_version() {
    let h = harness(
        47150,
        47160,
        desired(7, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    seed_repo(&h, "svc-1");
    h.vcs.set_commit("svc-1", "c1");
    h.reconciler.sync().await.unwrap();

    h.reconciler.heartbeat().await.unwrap();

    let heartbeats = h.api.heartbeats();
    assert_eq!(heartbeats.len(), 1);
    let hb = &heartbeats[0];
    assert_eq!(hb.stack_version, 7);
    assert_eq!(hb.agent_status, "healthy");
    assert_eq!(hb.services_status.len(), 1);
    assert_eq!(hb.services_status[0].service_id, "svc-1");
    assert_eq!(hb.services_status[0].status, "running");
}

#[tokio::test]
async fn restart_recovery_readopts_the_container_without_redeploying() {
    let dir_holder;
    let pair;
    // First agent lifetime: deploy normally, then drop everything except the
    // shared runtime and a copy of the persisted row.
    let runtime = Arc::new(MockRuntime::new());
    let persisted;
    {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::open_in_memory().await.unwrap());
        let secrets =
            Arc::new(SecretStore::new(dir.path().join("secrets"), "agent-test").unwrap());
        let ports = Arc::new(PortAllocator::new(47170, 47180));
        let lifecycle = LifecycleMap::new();
        let deployer = Arc::new(
            Deployer::new(
                dir.path().join("repos"),
                state.clone(),
                secrets,
                runtime.clone() as Arc<dyn ContainerRuntime>,
                ports.clone(),
                lifecycle.clone(),
                1000,
            )
            .with_timeouts(fast_timeouts()),
        );
        let repo = dir.path().join("repos").join("svc-1");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("Dockerfile"), "FROM alpine\n").unwrap();

        let service = svc("svc-1", "api", "api.example.com");
        deployer.deploy(&service, "c1").await.unwrap();
        pair = ports.get("svc-1").unwrap();
        persisted = state.get_service_process("svc-1").await.unwrap().unwrap();
        dir_holder = dir;
    }

    // Second agent lifetime: fresh state store seeded with the persisted row
    // (standing in for the on-disk database), same container runtime.
    let h = harness(
        47170,
        47180,
        desired(3, "h1", vec![svc("svc-1", "api", "api.example.com")]),
    )
    .await;
    let _ = &dir_holder;
    h.state.save_service_process(&persisted).await.unwrap();
    h.state.set_applied_state(3, "h1").await.unwrap();
    // Share the first lifetime's container table.
    *h.runtime.containers.lock() = runtime.containers.lock().clone();
    h.vcs.set_commit("svc-1", "c1");

    h.runtime.events.lock().clear();
    let report = h.reconciler.sync().await.unwrap();
    assert!(!report.had_errors);

    // The container was re-adopted, not rebuilt.
    let events = h.runtime.events();
    assert!(
        events.iter().all(|e| !e.starts_with("build:")),
        "recovery must not rebuild: {:?}",
        events
    );
    assert_eq!(
        h.reconciler.router().external_port_for("api.example.com"),
        Some(pair.blue_port)
    );
}
