//! Replica Set Integration Tests
//!
//! Bootstrap of a replica set against scripted hosts:
//! - Priority assignment and choice of the preferred primary
//! - Shutdown of the whole set after a failed member launch
//! - Restarts with and without re-initiation, with node filters

mod common;

use common::{
    Call, World, config, initiate_document, is_control_on, mongod, mongod_with, replset_yaml,
};
use dsi_cluster::{ClusterComponent, ClusterSetup, LaunchOptions, NodeFilter, NodeState};
use std::sync::Arc;

fn three_members() -> Vec<String> {
    vec![
        mongod_with("a1", 27017, "id: node-a1, "),
        mongod("a2", 27017),
        mongod("a3", 27017),
    ]
}

fn build(world: &Arc<World>, members: &[String]) -> ClusterSetup {
    let config = config(&replset_yaml("rs-main", members));
    ClusterSetup::new(Arc::new(config), world.factory()).unwrap()
}

async fn start(setup: &ClusterSetup) -> bool {
    setup.clusters()[0]
        .start(None, None, LaunchOptions::default(), &NodeFilter::all())
        .await
}

#[tokio::test]
async fn test_first_member_preferred_without_priorities() {
    let world = World::new();
    let setup = build(&world, &three_members());

    assert!(start(&setup).await);

    let initiations = world.scripts_containing("rs.initiate");
    assert_eq!(initiations.len(), 1);
    assert_eq!(initiations[0].0, "a1");

    let document = initiate_document(&initiations[0].1);
    assert_eq!(document["_id"], "rs-main");
    let members = document["members"].as_array().unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(members[0]["priority"], 2);
    assert_eq!(members[1]["priority"], 1);
    assert_eq!(members[2]["priority"], 1);
    assert_eq!(members[0]["_id"], 0);
    assert_eq!(members[2]["host"], "a3:27017");
    assert!(document.get("configsvr").is_none());

    // the primary probe targets the preferred member only
    let probes = world.scripts_containing("rs.isMaster().ismaster)");
    assert!(probes.iter().all(|(host, _)| host == "a1"));
}

#[tokio::test]
async fn test_highest_explicit_priority_is_preferred() {
    let world = World::new();
    let members = vec![
        mongod("a1", 27017),
        mongod("a2", 27017),
        mongod_with("a3", 27017, "rs_conf_member: {priority: 5}, "),
    ];
    let setup = build(&world, &members);

    assert!(start(&setup).await);

    let initiations = world.scripts_containing("rs.initiate");
    assert_eq!(initiations.len(), 1);
    assert_eq!(initiations[0].0, "a3");

    let document = initiate_document(&initiations[0].1);
    let priorities: Vec<_> = document["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|member| member["priority"].as_i64().unwrap())
        .collect();
    assert_eq!(priorities, [1, 1, 5]);
}

#[tokio::test]
async fn test_initiate_follows_every_member_launch() {
    let world = World::new();
    let setup = build(&world, &three_members());

    assert!(start(&setup).await);

    let last_launch = world.last_position(common::is_launch).unwrap();
    let initiate = world
        .position(|event| is_control_on(event, "a1", "rs.initiate"))
        .unwrap();
    assert!(last_launch < initiate);

    let ClusterComponent::ReplicaSet(set) = &setup.clusters()[0] else {
        panic!("expected a replica set");
    };
    assert!(set.nodes().iter().all(|node| node.state() == NodeState::Up));
    assert_eq!(
        set.connection_string_private(),
        "rs-main/a1:27017,a2:27017,a3:27017"
    );
}

#[tokio::test]
async fn test_member_launch_failure_shuts_set_down() {
    let world = World::new();
    world.fail_launch_on("a2");
    let setup = build(&world, &three_members());

    assert!(!start(&setup).await);

    assert!(world.scripts_containing("rs.initiate").is_empty());
    let shutdowns: Vec<_> = world
        .scripts_containing("shutdownServer")
        .into_iter()
        .map(|(host, _)| host)
        .collect();
    assert!(shutdowns.contains(&"a1".to_string()));
    assert!(shutdowns.contains(&"a3".to_string()));
    assert!(!world.is_running("a1"));
    assert!(!world.is_running("a3"));

    // the failed launch dumped the member's log
    assert!(world.calls_on("a2").iter().any(|call| matches!(
        call,
        Call::Run(command) if command.first().map(String::as_str) == Some("tail")
    )));
}

#[tokio::test]
async fn test_restart_keeping_data_skips_initiation() {
    let world = World::new();
    let setup = build(&world, &three_members());
    assert!(start(&setup).await);
    world.clear_events();

    assert!(
        setup
            .restart(Some(false), Some(false), &NodeFilter::all())
            .await
            .unwrap()
    );

    assert!(world.scripts_containing("rs.initiate").is_empty());
    assert_eq!(world.scripts_containing("shutdownServer").len(), 3);
    assert!(!world.scripts_containing("rs.isMaster().ismaster)").is_empty());
    assert_eq!(world.running_count(), 3);
}

#[tokio::test]
async fn test_restart_cleaning_data_initiates_again() {
    let world = World::new();
    let setup = build(&world, &three_members());
    assert!(start(&setup).await);
    world.clear_events();

    assert!(
        setup
            .restart(Some(true), None, &NodeFilter::all())
            .await
            .unwrap()
    );
    assert_eq!(world.scripts_containing("rs.initiate").len(), 1);
}

#[tokio::test]
async fn test_group_id_in_filter_covers_every_member() {
    let world = World::new();
    let setup = build(&world, &three_members());
    assert!(start(&setup).await);
    world.clear_events();

    assert!(
        setup
            .restart(Some(false), None, &NodeFilter::only(["rs-main"]))
            .await
            .unwrap()
    );

    let mut shut_down: Vec<_> = world
        .scripts_containing("shutdownServer")
        .into_iter()
        .map(|(host, _)| host)
        .collect();
    shut_down.sort();
    assert_eq!(shut_down, ["a1", "a2", "a3"]);
}

#[tokio::test]
async fn test_node_filter_restarts_one_member() {
    let world = World::new();
    let setup = build(&world, &three_members());
    assert!(start(&setup).await);
    world.clear_events();

    assert!(
        setup
            .restart(Some(false), None, &NodeFilter::only(["node-a1"]))
            .await
            .unwrap()
    );

    let shut_down: Vec<_> = world
        .scripts_containing("shutdownServer")
        .into_iter()
        .map(|(host, _)| host)
        .collect();
    assert_eq!(shut_down, ["a1"]);
    assert!(!world.calls_on("a2").iter().any(|call| matches!(
        call,
        Call::Run(command) if command.iter().any(|arg| arg == "--config")
    )));
    assert_eq!(world.running_count(), 3);
}

#[tokio::test]
async fn test_default_users_through_preferred_primary() {
    let world = World::new();
    let setup = build(&world, &three_members());
    assert!(start(&setup).await);

    assert!(setup.clusters()[0].add_default_users().await);

    let users = world.scripts_containing("createUser");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].0, "a1");
    assert!(users[0].1.contains("{\"w\":3}"));
}
