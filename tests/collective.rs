mod common;

use common::*;
use futures::FutureExt;
use phys_instances::prelude::*;
use serial_test::serial;
use std::time::Duration;

fn block<T: Send + 'static>(
    world: &InstanceWorld,
    node: usize,
    f: impl std::future::Future<Output = InstanceResult<T>> + Send + 'static,
) -> T {
    world.node(node).block_on(f).expect("collective operation")
}

#[test]
#[serial]
fn fill_reaches_every_point() {
    let world = world(3);
    let did = collective(&world, &[(0, 0), (1, 1), (2, 2)], false);
    let manager = collective_on(&world, 2, did);
    let done = manager
        .perform_collective_fill(&[VALUE], &5i64.to_le_bytes())
        .expect("fill");
    done.wait();
    for node in 0..3 {
        assert_eq!(read_point(&world, node, did, node as i64), uniform(5));
    }
}

#[test]
#[serial]
fn fill_from_outside_the_mapping() {
    let world = world(4);
    let did = collective(&world, &[(0, 0), (1, 1), (2, 2)], false);
    let remote = block(&world, 3, {
        let rt = world.node(3).clone();
        async move { rt.find_or_request_manager(did).await?.as_collective_manager() }
    });
    assert!(collective_on(&world, 0, did)
        .as_physical()
        .remote_holders()
        .contains(&3));
    remote
        .perform_collective_fill(&[VALUE], &9i64.to_le_bytes())
        .expect("fill")
        .wait();
    for node in 0..3 {
        assert_eq!(read_point(&world, node, did, node as i64), uniform(9));
    }
}

#[test]
#[serial]
fn broadcast_from_a_remote_point() {
    let world = world(2);
    let did = collective(&world, &[(0, 0), (0, 1), (1, 2), (1, 3)], true);
    fill_point(&world, 1, did, 2, 7);
    let manager = collective_on(&world, 0, did);
    let done = block(&world, 0, async move {
        manager
            .perform_collective_broadcast(DomainPoint(2), &[VALUE])
            .await
    });
    done.wait();
    for (node, point) in [(0, 0), (0, 1), (1, 2), (1, 3)] {
        assert_eq!(read_point(&world, node, did, point), uniform(7));
    }
}

#[test]
#[serial]
fn reduction_into_one_point() {
    let world = world(3);
    let did = collective(&world, &[(0, 0), (1, 1), (2, 2)], false);
    for node in 0..3 {
        fill_point(&world, node, did, node as i64, node as i64 + 1);
    }
    let manager = collective_on(&world, 2, did);
    let done = block(&world, 2, async move {
        manager
            .perform_collective_reduction(&[VALUE], ReductionOpKind::Sum, DomainPoint(0))
            .await
    });
    done.wait();
    assert_eq!(read_point(&world, 0, did, 0), uniform(6));
    assert_eq!(read_point(&world, 1, did, 1), uniform(2));
    assert_eq!(read_point(&world, 2, did, 2), uniform(3));
    let target = collective_on(&world, 0, did).as_physical();
    wait_until("reservations reclaimed", || target.reserved_points() == 0);
}

#[test]
#[serial]
fn reducecast_folds_an_individual_into_every_point() {
    let world = world(3);
    let did = collective(&world, &[(0, 0), (1, 1), (2, 2)], false);
    for node in 0..3 {
        fill_point(&world, node, did, node as i64, 1);
    }
    let source = individual(&world, 1);
    let source = source.as_individual().expect("individual").clone();
    source.fill(&[VALUE], &4i64.to_le_bytes()).expect("fill").wait();
    collective_on(&world, 1, did)
        .perform_collective_reducecast(&source, &[VALUE], ReductionOpKind::Sum)
        .expect("reducecast")
        .wait();
    for node in 0..3 {
        assert_eq!(read_point(&world, node, did, node as i64), uniform(5));
    }
}

#[test]
#[serial]
fn pointwise_copies_matching_points() {
    let world = world(2);
    let placement = [(0, 0), (0, 1), (1, 2), (1, 3)];
    let src = collective(&world, &placement, true);
    let dst = collective(&world, &placement, true);
    for (node, point) in placement {
        fill_point(&world, node, src, point, 10 * point);
    }
    let src_manager = collective_on(&world, 1, src);
    let dst_manager = collective_on(&world, 1, dst);
    let done = block(&world, 1, async move {
        dst_manager
            .perform_collective_pointwise(&src_manager, &[VALUE])
            .await
    });
    done.wait();
    for (node, point) in placement {
        assert_eq!(read_point(&world, node, dst, point), uniform(10 * point));
    }
}

#[test]
#[serial]
fn pointwise_needs_the_same_point_space() {
    let world = world(2);
    let src = collective(&world, &[(0, 0), (1, 1)], false);
    let dst = collective(&world, &[(0, 0), (1, 1), (1, 2)], true);
    let src_manager = collective_on(&world, 0, src);
    let dst_manager = collective_on(&world, 0, dst);
    let res = world.block_on(async move {
        dst_manager
            .perform_collective_pointwise(&src_manager, &[VALUE])
            .await
            .map(|_| ())
    });
    assert!(matches!(
        res,
        Err(InstanceError::LayoutUnsatisfiable {
            kind: LayoutConstraintKind::Dimension,
            ..
        })
    ));
}

#[test]
#[serial]
fn hourglass_reduces_then_broadcasts() {
    let world = world(4);
    let src = collective(&world, &[(0, 0), (1, 1), (2, 2), (3, 3)], false);
    let dst = collective(&world, &[(2, 0), (3, 1)], false);
    for node in 0..4 {
        fill_point(&world, node, src, node as i64, node as i64 + 1);
    }
    let src_manager = collective_on(&world, 2, src);
    let dst_manager = collective_on(&world, 2, dst);
    let done = block(&world, 2, async move {
        src_manager
            .perform_collective_hourglass(&dst_manager, &[VALUE], ReductionOpKind::Sum)
            .await
    });
    done.wait();
    assert_eq!(read_point(&world, 2, dst, 0), uniform(10));
    assert_eq!(read_point(&world, 3, dst, 1), uniform(10));
}

#[test]
#[serial]
fn points_are_found_by_memory() {
    let world = world(3);
    let did = collective(&world, &[(0, 0), (0, 1), (1, 2), (1, 3)], true);
    let remote_memory = world.node(1).memories()[0].id();
    let manager = collective_on(&world, 0, did);
    let (mut in_memory, mut nearest) = block(&world, 0, async move {
        let in_memory = manager.find_points_in_memory(remote_memory).await?;
        let nearest = manager.find_points_nearest_memory(remote_memory).await?;
        Ok((in_memory, nearest))
    });
    in_memory.sort();
    nearest.sort();
    assert_eq!(in_memory, vec![DomainPoint(2), DomainPoint(3)]);
    assert_eq!(nearest, in_memory);

    let outside = block(&world, 2, {
        let rt = world.node(2).clone();
        async move { rt.find_or_request_manager(did).await?.as_collective_manager() }
    });
    let location = block(&world, 2, async move {
        outside.find_or_forward_physical_instance(DomainPoint(3)).await
    });
    assert_eq!(location.node, 1);
    assert_eq!(location.memory, remote_memory);
}

#[test]
#[serial]
fn abandoned_lookups_do_not_strand_later_ones() {
    let world = world(3);
    let did = collective(&world, &[(0, 0), (0, 1), (1, 2), (1, 3)], true);
    let outside = block(&world, 2, {
        let rt = world.node(2).clone();
        async move { rt.find_or_request_manager(did).await?.as_collective_manager() }
    });
    assert!(outside
        .find_or_forward_physical_instance(DomainPoint(3))
        .now_or_never()
        .is_none());
    assert_eq!(outside.pending_point_lookups(), 1);

    let (tx, rx) = crossbeam::channel::bounded(1);
    let lookup = outside.clone();
    world
        .node(2)
        .spawn(async move {
            let _ = tx.send(lookup.find_or_forward_physical_instance(DomainPoint(3)).await);
        })
        .detach();
    let location = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second lookup finished")
        .expect("point location");
    assert_eq!(location.node, 1);
    assert_eq!(outside.pending_point_lookups(), 0);
}

#[test]
#[serial]
fn collected_instances_refuse_data_movement() {
    let world = world(2);
    let did = collective(&world, &[(0, 0), (1, 1)], false);
    let owner = collective_on(&world, 0, did);
    let res = world.block_on({
        let owner = owner.clone();
        async move { owner.as_physical().collect().expect("collectable").await }
    });
    assert!(res.is_ok());
    assert_eq!(owner.as_physical().gc_state(), GcState::Collected);
    assert!(matches!(
        owner.perform_collective_fill(&[VALUE], &1i64.to_le_bytes()),
        Err(InstanceError::InvalidInstanceState { .. })
    ));
    wait_until("deletion on node 1", || world.node(1).find_manager(&did).is_none());
}
