//! Cluster Setup Integration Tests
//!
//! Full lifecycle through [`ClusterSetup`] and the command phases around it.

mod common;

use common::{Call, Event, World, config, is_launch, mongod_with, replset_yaml};
use dsi_cluster::{
    ClusterError, ClusterRestart, ClusterSetup, CommandDispatcher, DispatchError, FailurePolicy,
    NodeFilter,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

const PHASES: &str = r#"
pre_cluster_start:
  - on_localhost: "echo pre"
post_cluster_start:
  - on_localhost: "echo post"
phases:
  between_tests:
    - restart_mongodb: {clean_db_dir: false, clean_logs: false}
"#;

fn members() -> Vec<String> {
    ["a1", "a2", "a3"]
        .iter()
        .map(|ip| mongod_with(ip, 27017, &format!("id: node-{}, ", ip)))
        .collect()
}

fn build(world: &Arc<World>, extra: &str) -> (Arc<ClusterSetup>, CommandDispatcher) {
    let yaml = format!("{}{}{}", extra, PHASES, replset_yaml("rs-main", &members()));
    let config = Arc::new(config(&yaml));
    let setup = Arc::new(ClusterSetup::new(Arc::clone(&config), world.factory()).unwrap());
    let dispatcher = CommandDispatcher::new(
        &config,
        world.factory(),
        setup.host_groups(),
        Some(Arc::clone(&setup) as Arc<dyn ClusterRestart>),
    )
    .unwrap();
    (setup, dispatcher)
}

fn is_local_echo(event: &Event, word: &str) -> bool {
    let last_word = |command: &Vec<String>| command.last().map(String::as_str) == Some(word);
    event.host == "localhost" && matches!(&event.call, Call::Run(command) if last_word(command))
}

#[tokio::test]
async fn test_start_order() {
    let world = World::new();
    world.start_process("a2", 27017, "mongod");
    let (setup, dispatcher) = build(&world, "");

    assert!(setup.start(&dispatcher).await.unwrap());

    let kill = world
        .position(|event| matches!(event.call, Call::Signal { .. }))
        .unwrap();
    let pre = world.position(|event| is_local_echo(event, "echo pre")).unwrap();
    let first_launch = world.position(is_launch).unwrap();
    let initiate = world
        .position(|event| common::is_control_on(event, "a1", "rs.initiate"))
        .unwrap();
    let post = world.position(|event| is_local_echo(event, "echo post")).unwrap();

    assert!(kill < pre);
    assert!(pre < first_launch);
    assert!(initiate < post);
    assert_eq!(world.running_count(), 3);
    assert!(!setup.auth_active());
}

#[tokio::test]
async fn test_failed_start_still_runs_post_commands() {
    let world = World::new();
    world.fail_launch_on("a2");
    let (setup, dispatcher) = build(&world, "");

    assert!(!setup.start(&dispatcher).await.unwrap());

    assert!(world.position(|event| is_local_echo(event, "echo post")).is_some());
    assert_eq!(world.running_count(), 0);
}

#[tokio::test]
async fn test_failed_pre_commands_exit_before_launch() {
    let world = World::new();
    world.fail_commands_containing("echo pre");
    let (setup, dispatcher) = build(&world, "");
    let status = Arc::new(AtomicI32::new(-1));
    let hook_status = Arc::clone(&status);
    let dispatcher = dispatcher.with_exit_hook(Arc::new(move |code| {
        hook_status.store(code, Ordering::SeqCst);
    }));

    let result = setup.start(&dispatcher).await;

    assert!(matches!(result, Err(DispatchError::Exited(_))));
    assert_eq!(status.load(Ordering::SeqCst), 1);
    assert!(world.position(is_launch).is_none());
}

#[tokio::test]
async fn test_clean_restart_of_subset_refused() {
    let world = World::new();
    let (setup, _dispatcher) = build(&world, "");

    let result = setup
        .restart(Some(true), None, &NodeFilter::only(["node-a1"]))
        .await;

    assert!(matches!(result, Err(ClusterError::Configuration(_))));
    assert!(world.events().is_empty());
}

#[tokio::test]
async fn test_authentication_bootstrap() {
    let world = World::new();
    let (setup, dispatcher) = build(
        &world,
        "authentication: {enabled: true, username: admin, password: s3cret}\n",
    );

    assert!(setup.start(&dispatcher).await.unwrap());
    assert!(setup.auth_active());

    let created = world
        .position(|event| common::is_control_on(event, "a1", "createUser"))
        .unwrap();
    let events = world.events();
    assert!(matches!(
        &events[created].call,
        Call::Control { script, authenticated: false, .. } if script.contains("\"admin\"")
    ));

    // the second launch writes access control into every member's config
    for host in ["a1", "a2", "a3"] {
        let secured = events.iter().skip(created).any(|event| {
            event.host == host
                && matches!(&event.call, Call::CreateFile { content, .. }
                    if content.contains("authorization: enabled"))
        });
        assert!(secured, "{} relaunched without access control", host);
    }

    // control calls after the relaunch carry credentials
    let last_probe = world
        .last_position(|event| common::is_control_on(event, "a1", "serverStatus"))
        .unwrap();
    assert!(matches!(
        &events[last_probe].call,
        Call::Control { authenticated: true, .. }
    ));
}

#[tokio::test]
async fn test_restart_keeps_authentication() {
    let world = World::new();
    let (setup, dispatcher) = build(
        &world,
        "authentication: {enabled: true, username: admin, password: s3cret}\n",
    );
    assert!(setup.start(&dispatcher).await.unwrap());
    world.clear_events();

    assert!(
        setup
            .restart(Some(false), Some(false), &NodeFilter::all())
            .await
            .unwrap()
    );

    let events = world.events();
    assert!(events.iter().any(|event| matches!(
        &event.call,
        Call::Control { script, authenticated: true, .. } if script.contains("shutdownServer")
    )));
    let secured = events
        .iter()
        .filter(|event| {
            matches!(&event.call, Call::CreateFile { content, .. }
                if content.contains("authorization: enabled"))
        })
        .count();
    assert_eq!(secured, 3);
    assert!(world.scripts_containing("createUser").is_empty());
}

#[tokio::test]
async fn test_restart_entry_restarts_cluster() {
    let world = World::new();
    let (setup, dispatcher) = build(&world, "");
    assert!(setup.start(&dispatcher).await.unwrap());
    world.clear_events();

    dispatcher
        .run_phase("between_tests", FailurePolicy::Reraise)
        .await
        .unwrap();

    assert_eq!(world.scripts_containing("shutdownServer").len(), 3);
    assert!(world.scripts_containing("rs.initiate").is_empty());
    assert_eq!(world.running_count(), 3);
}

#[tokio::test]
async fn test_topology_groups_are_addressable() {
    let world = World::new();
    let yaml = format!(
        "post_cluster_start:\n  - on_mongod: \"hostname\"\n{}",
        replset_yaml("rs-main", &members())
    );
    let config = Arc::new(config(&yaml));
    let setup = ClusterSetup::new(Arc::clone(&config), world.factory()).unwrap();
    let dispatcher =
        CommandDispatcher::new(&config, world.factory(), setup.host_groups(), None).unwrap();

    dispatcher
        .run_phase("post_cluster_start", FailurePolicy::Reraise)
        .await
        .unwrap();

    for host in ["a1", "a2", "a3"] {
        assert!(world.calls_on(host).iter().any(|call| matches!(
            call,
            Call::Run(command) if command[..] == ["sh", "-c", "hostname"]
        )));
    }
}

#[tokio::test]
async fn test_shutdown_and_destroy_everything() {
    let world = World::new();
    let (setup, dispatcher) = build(&world, "");
    assert!(setup.start(&dispatcher).await.unwrap());

    assert!(
        setup
            .shutdown(std::time::Duration::from_secs(1), None, &NodeFilter::all())
            .await
    );
    assert_eq!(world.running_count(), 0);

    world.start_process("a3", 27017, "mongod");
    assert!(
        setup
            .destroy(std::time::Duration::from_secs(1), &NodeFilter::all())
            .await
    );
    assert_eq!(world.running_count(), 0);

    setup.close().await;
}
