mod common;

use common::*;
use phys_instances::instance::{AllReduceSchedule, StageStep};
use phys_instances::prelude::*;
use serial_test::serial;

fn allreduce_world(num_nodes: usize, hammer_threshold: usize) -> InstanceWorld {
    init_tracing();
    let world = InstanceWorldBuilder::new()
        .with_num_nodes(num_nodes)
        .with_radix(2)
        .with_threads(2)
        .with_hammer_threshold(hammer_threshold)
        .build();
    world.register_field_space(field_space());
    world
}

/// `points_per_node` points on each node, point p holding p + 1; returns the expected result
fn run_allreduce(num_nodes: usize, points_per_node: i64, hammer_threshold: usize, redop: ReductionOpKind) {
    let world = allreduce_world(num_nodes, hammer_threshold);
    let placement: Vec<(usize, i64)> = (0..num_nodes)
        .flat_map(|node| {
            (0..points_per_node).map(move |i| (node, node as i64 * points_per_node + i))
        })
        .collect();
    let did = collective(&world, &placement, points_per_node > 1);
    for (node, point) in placement.iter() {
        fill_point(&world, *node, did, *point, point + 1);
    }
    let expected = placement
        .iter()
        .map(|(_, p)| p + 1)
        .fold(redop.identity(), |acc, v| redop.fold(acc, v));

    let tasks: Vec<_> = (0..num_nodes)
        .map(|node| {
            let manager = collective_on(&world, node, did);
            world.node(node).spawn(async move {
                manager
                    .perform_collective_allreduce(&[VALUE], redop, AllReduceTag(7))
                    .await
            })
        })
        .collect();
    for task in tasks {
        world.block_on(task).expect("all-reduce");
    }
    for (node, point) in placement.iter() {
        assert_eq!(read_point(&world, *node, did, *point), uniform(expected));
    }
}

macro_rules! allreduce_test {
    ($strategy:ident, $num_nodes:expr, $points:expr, $threshold:expr, $redop:ident) => {
        paste::paste! {
            #[test]
            #[serial]
            #[allow(non_snake_case)]
            fn [<$strategy _ $num_nodes _nodes_ $redop>]() {
                run_allreduce($num_nodes, $points, $threshold, ReductionOpKind::$redop);
            }
        }
    };
}

macro_rules! allreduce_nodes {
    ($strategy:ident, ($($num_nodes:expr),*), $points:expr, $threshold:expr, $redop:ident) => {
        $(
            allreduce_test!($strategy, $num_nodes, $points, $threshold, $redop);
        )*
    };
}

allreduce_nodes!(hammer, (1, 2), 1, 2, Sum);
allreduce_nodes!(tree, (3, 4, 5), 1, 2, Sum);
allreduce_nodes!(tree, (3, 4), 1, 2, Max);
allreduce_nodes!(doubling, (3, 4, 6), 2, 2, Sum);
allreduce_nodes!(doubling, (3, 5), 2, 2, Min);
allreduce_nodes!(hammer_multi, (3), 2, 4, Prod);

#[test]
#[serial]
fn reused_tag_keeps_messages_for_the_next_run() {
    let world = allreduce_world(2, 2);
    let did = collective(&world, &[(0, 0), (1, 1)], false);
    fill_point(&world, 0, did, 0, 1);
    fill_point(&world, 1, did, 1, 2);

    world.pause_link(0, 1);
    let tasks: Vec<_> = (0..2)
        .map(|node| {
            let manager = collective_on(&world, node, did);
            world.node(node).spawn(async move {
                for _ in 0..2 {
                    manager
                        .perform_collective_allreduce(&[VALUE], ReductionOpKind::Sum, AllReduceTag(3))
                        .await?;
                }
                Ok::<_, InstanceError>(())
            })
        })
        .collect();
    // node 0 finishes its first run and starts the second before node 1 hears from it
    wait_until("both runs from node 0 held", || world.held_messages(0, 1) == 2);
    world.resume_link(0, 1);
    for task in tasks {
        world.block_on(task).expect("all-reduce");
    }
    // 1 + 2, then 3 + 3
    assert_eq!(read_point(&world, 0, did, 0), uniform(6));
    assert_eq!(read_point(&world, 1, did, 1), uniform(6));
    for node in 0..2 {
        assert_eq!(collective_on(&world, node, did).pending_allreduce_stages(), 0);
    }
}

#[test]
fn schedule_pairs_match() {
    for participants in 1..=9 {
        let schedules: Vec<_> = (0..participants)
            .map(|rank| AllReduceSchedule::new(rank, participants))
            .collect();
        for schedule in schedules.iter() {
            for step in schedule.steps() {
                match *step {
                    StageStep::Exchange { stage, partner } => {
                        assert!(schedules[partner]
                            .steps()
                            .contains(&StageStep::Exchange {
                                stage,
                                partner: schedule.rank()
                            }));
                    }
                    StageStep::Send { stage, to } => {
                        let peer = &schedules[to];
                        assert!(peer.steps().iter().any(|s| matches!(
                            *s,
                            StageStep::Fold { stage: st, from } | StageStep::Replace { stage: st, from }
                                if st == stage && from == schedule.rank()
                        )));
                    }
                    _ => {}
                }
            }
        }
    }
}
