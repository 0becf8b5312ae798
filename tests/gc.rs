mod common;

use common::*;
use futures::FutureExt;
use phys_instances::env_var::CollectedPolicy;
use phys_instances::prelude::*;
use serial_test::serial;
use std::time::Duration;

/// An individual instance owned by node 0 that every other node also knows about
fn shared_instance(world: &InstanceWorld) -> (PhysicalManagerRef, Vec<PhysicalManagerRef>) {
    let owner = individual(world, 0);
    let did = owner.did();
    let remotes = (1..world.num_nodes())
        .map(|node| {
            owner
                .as_individual()
                .expect("individual")
                .send_manager(node)
                .expect("send manager");
            let rt = world.node(node).clone();
            world
                .node(node)
                .block_on(async move { rt.find_or_request_manager(did).await })
                .expect("remote manager")
                .as_physical_manager()
                .expect("physical manager")
        })
        .collect();
    (owner, remotes)
}

fn wait_for_deletion(world: &InstanceWorld, remotes: &[PhysicalManagerRef]) {
    for (node, remote) in remotes.iter().enumerate().map(|(i, r)| (i + 1, r)) {
        let did = remote.did();
        wait_until("deletion on remote holder", || {
            remote.gc_state() == GcState::Collected && world.node(node).find_manager(&did).is_none()
        });
    }
}

#[test]
#[serial]
fn unshared_instance_collects_immediately() {
    let world = world(1);
    let manager = individual(&world, 0);
    let did = manager.did();
    assert_eq!(manager.gc_state(), GcState::Collectable);
    assert!(manager.acquire_instance(ReferenceSource::Application).unwrap());
    assert_eq!(manager.gc_state(), GcState::Acquired);
    assert!(manager.collect().is_none());
    manager.release_instance(ReferenceSource::Application).unwrap();
    let collection = manager.collect().expect("collectable");
    world.block_on(collection).expect("collected");
    assert_eq!(manager.gc_state(), GcState::Collected);
    assert!(world.node(0).find_manager(&did).is_none());
    assert!(matches!(
        manager.acquire_instance(ReferenceSource::Application),
        Err(InstanceError::InvalidInstanceState {
            state: GcState::Collected,
            ..
        })
    ));
}

#[test]
#[serial]
fn valid_references_block_collection() {
    let world = world(1);
    let manager = individual(&world, 0);
    assert!(manager.add_valid_reference(ReferenceSource::Context(3)).unwrap());
    assert_eq!(manager.gc_state(), GcState::Valid);
    assert!(!manager.can_collect());
    manager
        .remove_valid_reference(ReferenceSource::Context(3))
        .unwrap();
    assert!(manager.register_active_context(8).unwrap());
    assert!(!manager.can_collect());
    assert!(manager.unregister_active_context(8));
    assert!(manager.can_collect());
    assert!(manager
        .remove_valid_reference(ReferenceSource::Context(3))
        .is_err());
}

#[test]
#[serial]
fn remote_reference_refuses_collection() {
    let world = world(3);
    let (owner, remotes) = shared_instance(&world);
    let did = owner.did();
    assert_eq!(owner.remote_holders(), vec![1, 2]);
    assert!(remotes[0].acquire_instance(ReferenceSource::Mapper(2)).unwrap());

    let refused = world.block_on(owner.collect().expect("collectable"));
    assert_eq!(refused, Err(InstanceError::GcRaceRefused { did }));
    assert_eq!(owner.gc_state(), GcState::Acquired);
    assert!(owner.can_collect());
    assert_eq!(remotes[0].gc_state(), GcState::Acquired);
    // node 2 agreed, then got its previous state back
    wait_until("node 2 restored", || {
        remotes[1].gc_state() == GcState::Collectable
    });
    assert!(world.node(2).find_manager(&did).is_some());

    remotes[0].release_instance(ReferenceSource::Mapper(2)).unwrap();
    world
        .block_on(owner.collect().expect("collectable"))
        .expect("collected");
    assert_eq!(owner.gc_state(), GcState::Collected);
    wait_for_deletion(&world, &remotes);
}

#[test]
#[serial]
fn outstanding_acknowledgments_block_collection() {
    let world = world(3);
    let (owner, remotes) = shared_instance(&world);
    let did = owner.did();

    world.pause_link(2, 0);
    let mut collection = owner.collect().expect("collectable");
    wait_until("node 1 answered, node 2 held", || {
        world.held_messages(2, 0) == 1 && owner.gc_debug_info().pending_responses == 1
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(owner.gc_state(), GcState::PendingCollected);
    assert!(world.node(0).find_manager(&did).is_some());
    assert!((&mut collection).now_or_never().is_none());
    assert!(owner.collect().is_none());
    assert_eq!(remotes[0].gc_state(), GcState::PendingCollected);
    assert_eq!(remotes[1].gc_state(), GcState::PendingCollected);

    world.resume_link(2, 0);
    world.block_on(collection).expect("collected");
    assert_eq!(owner.gc_state(), GcState::Collected);
    assert!(world.node(0).find_manager(&did).is_none());
    wait_for_deletion(&world, &remotes);
}

#[test]
#[serial]
fn owner_reference_cancels_a_pending_collection() {
    let world = world(2);
    let (owner, remotes) = shared_instance(&world);
    let did = owner.did();

    world.pause_link(1, 0);
    let collection = owner.collect().expect("collectable");
    wait_until("acknowledgment held", || world.held_messages(1, 0) == 1);
    assert_eq!(remotes[0].gc_state(), GcState::PendingCollected);
    assert!(owner
        .acquire_instance(ReferenceSource::Operation(1))
        .unwrap());
    assert_eq!(owner.gc_state(), GcState::Acquired);

    world.resume_link(1, 0);
    assert_eq!(
        world.block_on(collection),
        Err(InstanceError::GcRaceRefused { did })
    );
    assert_eq!(owner.gc_state(), GcState::Acquired);
    wait_until("remote restored", || {
        remotes[0].gc_state() == GcState::Collectable
    });

    owner.release_instance(ReferenceSource::Operation(1)).unwrap();
    world
        .block_on(owner.collect().expect("collectable"))
        .expect("collected");
    wait_for_deletion(&world, &remotes);
}

#[test]
#[serial]
fn ignored_policy_refuses_quietly_after_collection() {
    init_tracing();
    let world = InstanceWorldBuilder::new()
        .with_num_nodes(1)
        .with_collected_policy(CollectedPolicy::Ignore)
        .build();
    world.register_field_space(field_space());
    let manager = individual(&world, 0);
    world
        .block_on(manager.collect().expect("collectable"))
        .expect("collected");
    assert_eq!(
        manager.acquire_instance(ReferenceSource::Application),
        Ok(false)
    );
}

#[test]
#[serial]
fn remote_acquire_cancels_a_pending_collection() {
    let world = world(3);
    let (owner, remotes) = shared_instance(&world);
    let did = owner.did();

    world.pause_link(2, 0);
    let collection = owner.collect().expect("collectable");
    wait_until("node 1 agreed, node 2 held", || {
        remotes[0].gc_state() == GcState::PendingCollected && world.held_messages(2, 0) == 1
    });
    // agreed to the collection, so only the owner can hand out a reference now
    assert_eq!(
        remotes[0].acquire_instance(ReferenceSource::Application),
        Ok(false)
    );
    let acquired = world
        .node(1)
        .block_on({
            let remote = remotes[0].clone();
            async move { remote.acquire_instance_async(ReferenceSource::Application).await }
        })
        .unwrap();
    assert!(acquired);
    assert_eq!(remotes[0].gc_state(), GcState::Acquired);
    assert_eq!(owner.gc_state(), GcState::Acquired);

    world.resume_link(2, 0);
    assert_eq!(
        world.block_on(collection),
        Err(InstanceError::GcRaceRefused { did })
    );
    assert_eq!(owner.gc_state(), GcState::Acquired);
    wait_until("node 2 restored", || {
        remotes[1].gc_state() == GcState::Collectable
    });
    assert_eq!(remotes[0].gc_state(), GcState::Acquired);
    assert_eq!(remotes[0].gc_debug_info().references, 1);
    for node in 0..3 {
        assert!(world.node(node).find_manager(&did).is_some());
    }
}

#[test]
#[serial]
fn owner_debug_info_reports_holders() {
    let world = world(2);
    let (owner, remotes) = shared_instance(&world);
    let remote = remotes[0].clone();
    let info = world
        .node(1)
        .block_on({
            let remote = remote.clone();
            async move { remote.owner_gc_debug_info().await }
        })
        .unwrap();
    assert_eq!(info.node, 0);
    assert_eq!(info.remote_holders, vec![1]);
    assert_eq!(info.pending_responses, 0);
    assert!(remote.acquire_instance(ReferenceSource::Application).unwrap());
    assert_eq!(remote.gc_debug_info().references, 1);
    assert_eq!(owner.gc_debug_info().references, 0);
}

#[test]
#[serial]
fn priorities_take_the_minimum_vote() {
    let world = world(2);
    let (owner, remotes) = shared_instance(&world);
    let remote = &remotes[0];
    owner.set_garbage_collection_priority(0, 0, 5);
    assert_eq!(owner.effective_gc_priority(), Some(5));
    remote.set_garbage_collection_priority(1, 4, -3);
    wait_until("remote vote", || owner.effective_gc_priority() == Some(-3));
    owner.set_garbage_collection_priority(1, 4, 10);
    assert_eq!(owner.effective_gc_priority(), Some(5));
}

#[test]
#[serial]
fn unknown_managers_fail_requests() {
    let world = world(2);
    let owner = individual(&world, 0);
    let did = owner.did();
    world
        .block_on(owner.collect().expect("collectable"))
        .expect("collected");
    let rt = world.node(1).clone();
    let res = world
        .node(1)
        .block_on(async move { rt.find_or_request_manager(did).await.map(|m| m.did()) });
    assert_eq!(res, Err(InstanceError::UnknownManager(did)));
}
