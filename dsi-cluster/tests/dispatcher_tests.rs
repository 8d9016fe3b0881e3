//! Command Dispatcher Integration Tests
//!
//! Phases run against scripted hosts:
//! - Validation of targets, actions and payloads at construction
//! - Continue / Reraise / Exit failure policies
//! - Restart entries, network delays and the reports directory

mod common;

use async_trait::async_trait;
use common::{Call, World, config};
use dsi_cluster::dispatcher::HostGroups;
use dsi_cluster::{
    ClusterResult, ClusterRestart, CommandDispatcher, DispatchError, FailurePolicy, NodeFilter,
    SetupConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

const GROUPS: &str = r#"
host_groups:
  workload_client:
    - {public_ip: w1}
    - {public_ip: w2}
  db:
    - {public_ip: d1, alias: db-primary}
"#;

#[derive(Default)]
struct RecordingRestart {
    calls: Mutex<Vec<(Option<bool>, Option<bool>, NodeFilter)>>,
    fail: bool,
}

#[async_trait]
impl ClusterRestart for RecordingRestart {
    async fn restart(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> ClusterResult<bool> {
        self.calls
            .lock()
            .push((clean_db_dir, clean_logs, filter.clone()));
        Ok(!self.fail)
    }
}

fn setup_config(phases: &str) -> SetupConfig {
    config(&format!("{}{}", GROUPS, phases))
}

fn dispatcher(world: &Arc<World>, config: &SetupConfig) -> CommandDispatcher {
    let groups = HostGroups::new(config.host_groups.clone());
    CommandDispatcher::new(config, world.factory(), groups, None).unwrap()
}

fn ran(world: &World, host: &str, line: &str) -> bool {
    world.calls_on(host).iter().any(|call| {
        matches!(call, Call::Run(command) if command[..] == ["sh", "-c", line])
    })
}

const TWO_STEPS: &str = r#"
phases:
  between_tests:
    - on_workload_client: "false-command"
    - on_workload_client: "echo after"
"#;

#[tokio::test]
async fn test_unknown_action_rejected_before_running() {
    let world = World::new();
    let config = setup_config(
        r#"
pre_cluster_start:
  - on_workload_client: {exec: "echo fine"}
post_cluster_start:
  - on_workload_client: {exec_magic: "ls"}
"#,
    );
    let groups = HostGroups::new(config.host_groups.clone());
    let result = CommandDispatcher::new(&config, world.factory(), groups, None);

    match result {
        Err(DispatchError::Configuration(message)) => {
            assert!(message.contains("post_cluster_start"));
            assert!(message.contains("exec_magic"));
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("unknown action accepted"),
    }
    assert!(world.events().is_empty());
}

#[tokio::test]
async fn test_unknown_group_and_target_rejected() {
    let world = World::new();
    for phases in [
        "upon_error:\n  - on_nobody: \"ls\"\n",
        "upon_error:\n  - reboot_everything: {}\n",
        "upon_error:\n  - network_delays: {delay_ms: 5, jitter: 1}\n",
    ] {
        let config = setup_config(phases);
        let groups = HostGroups::new(config.host_groups.clone());
        assert!(matches!(
            CommandDispatcher::new(&config, world.factory(), groups, None),
            Err(DispatchError::Configuration(_))
        ));
    }
}

#[tokio::test]
async fn test_continue_runs_remaining_entries() {
    let world = World::new();
    world.fail_commands_containing("false-command");
    let config = setup_config(TWO_STEPS);
    let dispatcher = dispatcher(&world, &config);

    dispatcher
        .run_phase("between_tests", FailurePolicy::Continue)
        .await
        .unwrap();

    assert!(ran(&world, "w1", "echo after"));
    assert!(ran(&world, "w2", "echo after"));
}

#[tokio::test]
async fn test_reraise_stops_phase() {
    let world = World::new();
    world.fail_commands_containing("false-command");
    let config = setup_config(TWO_STEPS);
    let dispatcher = dispatcher(&world, &config);

    let err = dispatcher
        .run_phase("between_tests", FailurePolicy::Reraise)
        .await
        .unwrap_err();

    match err {
        DispatchError::Action {
            phase,
            target,
            action,
            ..
        } => {
            assert_eq!(phase, "between_tests");
            assert_eq!(target, "on_workload_client");
            assert_eq!(action, "exec");
        }
        other => panic!("unexpected error {}", other),
    }
    assert!(!ran(&world, "w1", "echo after"));
}

#[tokio::test]
async fn test_exit_policy_calls_exit_hook() {
    let world = World::new();
    world.fail_commands_containing("false-command");
    let config = setup_config(TWO_STEPS);
    let status = Arc::new(AtomicI32::new(-1));
    let hook_status = Arc::clone(&status);
    let dispatcher = dispatcher(&world, &config).with_exit_hook(Arc::new(move |code| {
        hook_status.store(code, Ordering::SeqCst);
    }));

    let result = dispatcher
        .run_phase("between_tests", FailurePolicy::Exit)
        .await;

    assert!(matches!(result, Err(DispatchError::Exited(_))));
    assert_eq!(status.load(Ordering::SeqCst), 1);
    assert!(!ran(&world, "w2", "echo after"));
}

#[tokio::test]
async fn test_fan_out_reaches_every_host_despite_failure() {
    let world = World::new();
    world.make_unreachable("w2");
    let config = setup_config("post_cluster_start:\n  - on_workload_client: \"uptime\"\n");
    let dispatcher = dispatcher(&world, &config);

    let err = dispatcher
        .run_phase("post_cluster_start", FailurePolicy::Reraise)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("w2"));
    assert!(ran(&world, "w1", "uptime"));
    // every host that was opened is closed again
    assert!(world.calls_on("w1").contains(&Call::Close));
}

#[tokio::test]
async fn test_actions_run_in_order_per_host() {
    let world = World::new();
    let config = setup_config(
        r#"
post_cluster_start:
  - on_db:
      upload_files:
        - {content: "threads: 8", target: /tmp/workload.yml}
      exec_control_script:
        script: "db.dropDatabase();"
        connection_string: "d1:27017"
      exec: [ls, -l]
"#,
    );
    let dispatcher = dispatcher(&world, &config);

    dispatcher
        .run_phase("post_cluster_start", FailurePolicy::Reraise)
        .await
        .unwrap();

    let calls = world.calls_on("db-primary");
    assert!(matches!(
        &calls[0],
        Call::CreateFile { path, content } if path == "/tmp/workload.yml" && content == "threads: 8"
    ));
    assert!(matches!(
        &calls[1],
        Call::Control { script, connection, authenticated: false }
            if script == "db.dropDatabase();" && connection == "d1:27017"
    ));
    assert_eq!(calls[2], Call::Run(vec!["ls".to_string(), "-l".to_string()]));
    assert_eq!(calls[3], Call::Close);
}

#[tokio::test]
async fn test_restart_entry_calls_cluster_restart() {
    let world = World::new();
    let config = setup_config(
        r#"
phases:
  between_tests:
    - restart_mongodb: {clean_db_dir: false, clean_logs: true, nodes: [shard-a, shard-b]}
    - restart_cluster: {clean_logs: false}
"#,
    );
    let restart = Arc::new(RecordingRestart::default());
    let groups = HostGroups::new(config.host_groups.clone());
    let dispatcher = CommandDispatcher::new(
        &config,
        world.factory(),
        groups,
        Some(Arc::clone(&restart) as Arc<dyn ClusterRestart>),
    )
    .unwrap();

    dispatcher
        .run_phase("between_tests", FailurePolicy::Reraise)
        .await
        .unwrap();

    let calls = restart.calls.lock().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        (Some(false), Some(true), NodeFilter::only(["shard-a", "shard-b"]))
    );
    assert_eq!(calls[1], (None, Some(false), NodeFilter::all()));
}

#[tokio::test]
async fn test_failed_restart_is_reported() {
    let world = World::new();
    let config = setup_config("upon_error:\n  - restart_database: {clean_db_dir: false}\n");
    let restart: Arc<dyn ClusterRestart> = Arc::new(RecordingRestart {
        fail: true,
        ..Default::default()
    });
    let groups = HostGroups::new(config.host_groups.clone());
    let dispatcher =
        CommandDispatcher::new(&config, world.factory(), groups, Some(restart)).unwrap();

    let result = dispatcher
        .run_phase("upon_error", FailurePolicy::Reraise)
        .await;
    assert!(matches!(result, Err(DispatchError::Restart { .. })));
}

#[tokio::test]
async fn test_network_delays_shorthand_covers_all_hosts() {
    let world = World::new();
    let config = setup_config(
        "pre_cluster_start:\n  - network_delays: {delay_ms: 50, jitter_ms: 5, interface: ens5}\n",
    );
    let dispatcher = dispatcher(&world, &config);

    dispatcher
        .run_phase("pre_cluster_start", FailurePolicy::Reraise)
        .await
        .unwrap();

    for host in ["w1", "w2", "db-primary"] {
        let calls = world.calls_on(host);
        assert_eq!(
            calls[0],
            Call::Run(
                ["sudo", "tc", "qdisc", "del", "dev", "ens5", "root"]
                    .map(String::from)
                    .to_vec()
            )
        );
        assert_eq!(
            calls[1],
            Call::Run(
                [
                    "sudo", "tc", "qdisc", "add", "dev", "ens5", "root", "netem", "delay", "50ms",
                    "5ms"
                ]
                .map(String::from)
                .to_vec()
            )
        );
    }
}

#[tokio::test]
async fn test_reset_all_delays_ignores_missing_qdisc() {
    let world = World::new();
    world.fail_commands_containing("qdisc del");
    let config = setup_config("");
    let dispatcher = dispatcher(&world, &config);

    dispatcher.reset_all_delays().await;

    for host in ["w1", "w2", "db-primary"] {
        let calls = world.calls_on(host);
        assert!(matches!(&calls[0], Call::Run(command) if command.contains(&"del".to_string())));
        let adds = |command: &Vec<String>| command.iter().any(|arg| arg == "add");
        assert!(
            !calls
                .iter()
                .any(|call| matches!(call, Call::Run(command) if adds(command)))
        );
    }
}

#[tokio::test]
async fn test_upon_error_files_land_in_reports() {
    let world = World::new();
    let work_dir = tempfile::tempdir().unwrap();
    let config = setup_config(
        r#"
upon_error:
  - on_workload_client:
      retrieve_files:
        - {source: /var/log/app.log, target: logs/app.log}
"#,
    );
    let dispatcher = dispatcher(&world, &config).with_work_dir(work_dir.path());

    dispatcher
        .run_upon_error("cluster_setup", FailurePolicy::Reraise)
        .await
        .unwrap();

    for host in ["w1", "w2"] {
        let path = work_dir
            .path()
            .join("reports/upon_error/cluster_setup")
            .join(host)
            .join("logs/app.log");
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("/var/log/app.log from {}", host));
    }
    assert!(
        std::fs::symlink_metadata(work_dir.path().join("reports"))
            .unwrap()
            .file_type()
            .is_symlink()
    );
}

#[tokio::test]
async fn test_missing_phase_is_a_no_op() {
    let world = World::new();
    let config = setup_config("");
    let dispatcher = dispatcher(&world, &config);

    dispatcher
        .run_phase("post_task", FailurePolicy::Exit)
        .await
        .unwrap();
    assert!(world.events().is_empty());
}
