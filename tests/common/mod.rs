#![allow(dead_code)]

use phys_instances::prelude::*;

use std::sync::Arc;

pub const FS_ID: u32 = 1;
pub const TREE: u32 = 1;
pub const VALUE: FieldId = 10;
pub const AUX: FieldId = 11;
pub const VOLUME: i64 = 8;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn world(num_nodes: usize) -> InstanceWorld {
    init_tracing();
    let world = InstanceWorldBuilder::new()
        .with_num_nodes(num_nodes)
        .with_radix(2)
        .with_threads(2)
        .build();
    world.register_field_space(field_space());
    world
}

pub fn field_space() -> FieldSpace {
    FieldSpace::new(FS_ID, vec![(VALUE, 8), (AUX, 8)])
}

pub fn region() -> LogicalRegion {
    LogicalRegion::new(TREE, FS_ID, Domain::new(0, VOLUME))
}

pub fn constraints() -> LayoutConstraintSet {
    LayoutConstraintSet::new(vec![VALUE, AUX])
}

pub fn individual(world: &InstanceWorld, node: usize) -> PhysicalManagerRef {
    let rt = world.node(node);
    InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
        .create_physical_instance()
        .expect("individual instance")
}

/// Creates one point per `(node, point)` entry and waits until the owner saw every point
pub fn collective(
    world: &InstanceWorld,
    placement: &[(usize, i64)],
    multi_instance: bool,
) -> DistributedId {
    let mapping = world.mapping(placement.iter().map(|(node, _)| *node));
    let lo = placement.iter().map(|(_, p)| *p).min().unwrap();
    let hi = placement.iter().map(|(_, p)| *p).max().unwrap() + 1;
    let origin = mapping.get_origin();
    let pending =
        PendingCollectiveManager::new(world.node(origin), Domain::new(lo, hi), mapping, multi_instance);
    for (node, point) in placement {
        let rt = world.node(*node);
        InstanceBuilder::new(rt, vec![region()], constraints(), rt.memories()[0].id())
            .with_collective(pending.clone(), DomainPoint(*point))
            .create_physical_instance()
            .expect("point instance");
    }
    let did = pending.did();
    let owner = collective_on(world, did.owner(), did);
    world
        .node(did.owner())
        .block_on(async move { owner.instances_ready().await })
        .expect("instances ready");
    assert!(!collective_on(world, did.owner(), did).creation_failed());
    did
}

pub fn collective_on(world: &InstanceWorld, node: usize, did: DistributedId) -> Arc<CollectiveManager> {
    world
        .node(node)
        .find_manager(&did)
        .expect("manager known on node")
        .as_collective_manager()
        .expect("collective manager")
}

pub fn fill_point(world: &InstanceWorld, node: usize, did: DistributedId, point: i64, value: i64) {
    collective_on(world, node, did)
        .fill_point(DomainPoint(point), &[VALUE], &value.to_le_bytes())
        .expect("fill point");
}

pub fn read_point(world: &InstanceWorld, node: usize, did: DistributedId, point: i64) -> Vec<i64> {
    collective_on(world, node, did)
        .gather_point(DomainPoint(point), &[VALUE])
        .expect("gather point")
        .field_as_i64(VALUE)
        .expect("value field")
}

pub fn uniform(value: i64) -> Vec<i64> {
    vec![value; VOLUME as usize]
}

/// Polls `condition` until it holds, panicking after ten seconds
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > std::time::Duration::from_secs(10) {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
