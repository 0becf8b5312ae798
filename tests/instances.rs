mod common;

use common::*;
use futures::FutureExt;
use phys_instances::layout::MemoryKind;
use phys_instances::memory::MemoryId;
use phys_instances::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn build(
    world: &InstanceWorld,
    node: usize,
    constraints: LayoutConstraintSet,
) -> InstanceResult<PhysicalManagerRef> {
    let rt = world.node(node);
    InstanceBuilder::new(rt, vec![region()], constraints, rt.memories()[0].id())
        .create_physical_instance()
}

#[test]
#[serial]
fn layouts_are_shared() {
    let world = world(1);
    let a = build(&world, 0, constraints()).unwrap();
    let b = build(&world, 0, constraints()).unwrap();
    assert_ne!(a.did(), b.did());
    assert!(Arc::ptr_eq(a.layout(), b.layout()));
    let c = build(&world, 0, constraints().with_ordering(FieldOrdering::Aos)).unwrap();
    assert!(!Arc::ptr_eq(a.layout(), c.layout()));
    assert_eq!(world.node(0).layouts().len(), 2);
    assert_eq!(a.footprint(), 16 * VOLUME as usize);
}

#[test]
#[serial]
fn unsatisfiable_constraints() {
    let world = world(1);
    assert!(matches!(
        build(&world, 0, LayoutConstraintSet::new(vec![VALUE, 99])),
        Err(InstanceError::LayoutUnsatisfiable {
            kind: LayoutConstraintKind::Field,
            field_index: Some(1),
        })
    ));
    let mut virtual_constraints = constraints();
    virtual_constraints.specialized = SpecializedKind::Virtual;
    assert!(matches!(
        build(&world, 0, virtual_constraints),
        Err(InstanceError::LayoutUnsatisfiable {
            kind: LayoutConstraintKind::Specialized,
            ..
        })
    ));
    assert!(matches!(
        build(&world, 0, constraints().in_memory_kind(MemoryKind::Framebuffer)),
        Err(InstanceError::LayoutUnsatisfiable {
            kind: LayoutConstraintKind::Memory,
            ..
        })
    ));
    let rt = world.node(0);
    let unknown = LogicalRegion::new(TREE, 77, Domain::new(0, 4));
    assert_eq!(
        InstanceBuilder::new(rt, vec![unknown], constraints(), rt.memories()[0].id())
            .create_physical_instance()
            .map(|m| m.did()),
        Err(InstanceError::UnknownFieldSpace(77))
    );
}

#[test]
#[serial]
fn allocation_failure_and_eager_pool() {
    init_tracing();
    let world = InstanceWorldBuilder::new()
        .with_memory_capacity(256)
        .with_eager_fraction(0.5)
        .build();
    world.register_field_space(field_space());
    let rt = world.node(0);
    let memory = rt.memories()[0].id();
    let first = InstanceBuilder::new(rt, vec![region()], constraints(), memory)
        .create_physical_instance()
        .expect("fits in the normal pool");
    assert!(matches!(
        InstanceBuilder::new(rt, vec![region()], constraints(), memory).create_physical_instance(),
        Err(InstanceError::AllocationFailed { footprint: 128, .. })
    ));
    let eager = InstanceBuilder::new(rt, vec![region()], constraints(), memory)
        .eager()
        .create_physical_instance()
        .expect("fits in the eager pool");
    assert_eq!(eager.as_individual().unwrap().kind(), InstanceKind::Eager);
    world.block_on(first.collect().expect("collectable")).unwrap();
    assert!(InstanceBuilder::new(rt, vec![region()], constraints(), memory)
        .create_physical_instance()
        .is_ok());
}

#[test]
#[serial]
fn failed_points_are_reported() {
    let world = world(2);
    let mapping = world.mapping([0, 1]);
    let pending = PendingCollectiveManager::new(world.node(0), Domain::new(0, 2), mapping, false);
    let rt0 = world.node(0);
    InstanceBuilder::new(rt0, vec![region()], constraints(), rt0.memories()[0].id())
        .with_collective(pending.clone(), DomainPoint(0))
        .create_physical_instance()
        .expect("point 0");
    let rt1 = world.node(1);
    let remote_memory = MemoryId { node: 0, index: 0 };
    assert_eq!(
        InstanceBuilder::new(rt1, vec![region()], constraints(), remote_memory)
            .with_collective(pending.clone(), DomainPoint(1))
            .create_physical_instance()
            .map(|m| m.did()),
        Err(InstanceError::UnknownMemory(remote_memory))
    );
    let owner = collective_on(&world, 0, pending.did());
    world
        .block_on({
            let owner = owner.clone();
            async move { owner.instances_ready().await }
        })
        .unwrap();
    assert!(owner.creation_failed());
    let res = world.block_on(async move {
        owner
            .find_or_forward_physical_instance(DomainPoint(1))
            .await
    });
    assert!(matches!(res, Err(InstanceError::PointNotFound { .. })));
}

#[test]
#[serial]
fn one_point_per_node_unless_multi_instance() {
    let world = world(1);
    let pending =
        PendingCollectiveManager::new(world.node(0), Domain::new(0, 2), world.mapping([0]), false);
    let rt = world.node(0);
    let point = |p: i64| {
        InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
            .with_collective(pending.clone(), DomainPoint(p))
            .create_physical_instance()
    };
    assert!(point(0).is_ok());
    assert!(matches!(
        point(1),
        Err(InstanceError::InvalidInstanceState { .. })
    ));
}

#[test]
#[serial]
fn unbound_instances_bind_everywhere() {
    let world = world(2);
    let rt = world.node(0);
    let owner = InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
        .unbound()
        .create_physical_instance()
        .unwrap();
    let owner = owner.as_individual().unwrap().clone();
    assert!(!owner.is_bound());
    owner.send_manager(1).unwrap();
    let did = owner.did();
    let rt1 = world.node(1).clone();
    let remote = world
        .node(1)
        .block_on(async move { rt1.find_or_request_manager(did).await })
        .unwrap()
        .as_individual_manager()
        .unwrap();
    assert!(!remote.is_bound());
    owner.allocate_deferred().unwrap();
    assert!(owner.is_bound());
    assert!(remote.bound_event().wait_timeout(Duration::from_secs(10)));
    assert_eq!(remote.instance(), owner.instance());
    assert!(matches!(
        owner.allocate_deferred(),
        Err(InstanceError::InvalidInstanceState { .. })
    ));
}

#[test]
#[serial]
fn external_instances_detach() {
    let world = world(1);
    let rt = world.node(0);
    let footprint = 16 * VOLUME as usize;
    assert!(matches!(
        InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
            .attach_external(vec![0u8; footprint - 1], false)
            .create_physical_instance(),
        Err(InstanceError::AllocationFailed { .. })
    ));
    let manager = InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
        .attach_external(vec![0u8; footprint], false)
        .create_physical_instance()
        .unwrap();
    assert!(manager.did().is_external_instance());
    let individual = manager.as_individual().unwrap();
    individual
        .fill(&[VALUE], &3i64.to_le_bytes())
        .unwrap()
        .wait();
    assert_eq!(
        individual.gather(&[VALUE]).unwrap().field_as_i64(VALUE),
        Some(uniform(3))
    );
    let bytes = individual.detach_external_instance().unwrap();
    assert_eq!(bytes.len(), footprint);
}

#[test]
#[serial]
fn top_views_are_memoized() {
    let world = world(2);
    let owner = individual(&world, 0);
    let views = world.block_on({
        let owner = owner.clone();
        async move {
            let a = owner.find_or_create_instance_top_view(5, 0, None);
            let b = owner.find_or_create_instance_top_view(5, 0, None);
            let (a, b) = futures::join!(a, b);
            Ok::<_, InstanceError>((a?, b?))
        }
    });
    let (a, b) = views.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(owner.gc_debug_info().valid_references, 1);
    assert_eq!(owner.gc_state(), GcState::Valid);

    owner.as_individual().unwrap().send_manager(1).unwrap();
    let did = owner.did();
    let rt1 = world.node(1).clone();
    let remote_view = world
        .node(1)
        .block_on(async move {
            let remote = rt1
                .find_or_request_manager(did)
                .await?
                .as_physical_manager()
                .ok_or(InstanceError::UnknownManager(did))?;
            remote.find_or_create_instance_top_view(5, 0, None).await
        })
        .unwrap();
    assert_eq!(remote_view.did, a.did);
    assert_eq!(remote_view.creator, 1);
    wait_until("view creation notice", || {
        world
            .node(0)
            .remote_views()
            .contains(&(a.did, did, 1))
    });

    owner.release_top_view(&a).unwrap();
    assert_eq!(owner.gc_debug_info().valid_references, 0);
}

#[test]
#[serial]
fn abandoned_top_view_construction_is_retried() {
    let world = world(2);
    let owner = individual(&world, 0);
    owner.as_individual().unwrap().send_manager(1).unwrap();
    let did = owner.did();
    let rt1 = world.node(1).clone();
    let remote = world
        .node(1)
        .block_on(async move { rt1.find_or_request_manager(did).await })
        .unwrap()
        .as_physical_manager()
        .unwrap();

    world.pause_link(0, 1);
    let first = remote.find_or_create_instance_top_view(9, 1, None);
    assert!(first.now_or_never().is_none());
    assert_eq!(remote.pending_top_views(), 0);
    world.resume_link(0, 1);

    let (tx, rx) = crossbeam::channel::bounded(1);
    world
        .node(1)
        .spawn({
            let remote = remote.clone();
            async move {
                let _ = tx.send(remote.find_or_create_instance_top_view(9, 1, None).await);
            }
        })
        .detach();
    let view = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second construction stalled")
        .unwrap();
    assert_eq!(view.creator, 1);
    assert_eq!(remote.pending_top_views(), 0);
}

#[test]
#[serial]
fn reservations_are_forgotten_once_released() {
    let world = world(1);
    let manager = individual(&world, 0);
    let did = manager.did();
    let mask = FieldMask::from_indices([0, 1]);

    let held = manager
        .lock_field_reservations(did, DomainPoint(0), &mask)
        .now_or_never()
        .expect("uncontended");
    assert_eq!(manager.reserved_points(), 1);
    let mut waiting = Box::pin(manager.lock_field_reservations(did, DomainPoint(0), &mask));
    assert!(waiting.as_mut().now_or_never().is_none());

    drop(held);
    // the waiter still needs the point
    assert_eq!(manager.reserved_points(), 1);
    let second = waiting.now_or_never().expect("released");
    assert_eq!(manager.reserved_points(), 1);
    drop(second);
    assert_eq!(manager.reserved_points(), 0);

    let abandoned = manager
        .lock_field_reservations(did, DomainPoint(1), &mask)
        .now_or_never();
    drop(abandoned);
    assert_eq!(manager.reserved_points(), 0);
}

#[test]
#[serial]
fn collecting_an_external_instance_without_storage() {
    let world = world(1);
    let rt = world.node(0);
    let footprint = 16 * VOLUME as usize;
    let manager = InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
        .attach_external(vec![0u8; footprint], false)
        .create_physical_instance()
        .unwrap();
    let instance = manager.as_individual().unwrap().instance().unwrap();
    let memory = rt.memory(instance.memory).unwrap();
    assert_eq!(memory.detach_external(&instance).unwrap().len(), footprint);

    let did = manager.did();
    world
        .block_on(manager.collect().expect("collectable"))
        .expect("collected");
    assert_eq!(manager.gc_state(), GcState::Collected);
    assert!(rt.find_manager(&did).is_none());
    assert!(memory.detach_external(&instance).is_err());
}
