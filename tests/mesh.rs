//! Multi-node scenarios over the in-process mesh transport.

use lockstep::test_utils::{init_test_logging, shutdown_mesh, test_mesh};
use lockstep::{assert_with_log, test_complete, test_phase};
use lockstep::{Barrier, ErrorKind, Event, ReductionOp, ReductionOpId};
use std::time::Duration;

const REDOP_ADD: ReductionOpId = 1;

fn read_i32(rt: &lockstep::Runtime, b: &Barrier) -> i32 {
    let mut out = [0_u8; 4];
    let ready = b.get_result(rt, &mut out).expect("get_result failed");
    if !ready {
        b.wait(rt).expect("barrier wait failed");
        assert!(
            b.get_result(rt, &mut out).expect("get_result failed"),
            "result not ready after wait"
        );
    }
    i32::from_le_bytes(out)
}

#[test]
fn remote_arrival_publishes_on_both_nodes() {
    init_test_logging();
    test_phase!("remote_arrival_publishes_on_both_nodes");
    let runtimes = test_mesh(2);
    runtimes[0]
        .register_reduction(ReductionOp::int_add(REDOP_ADD))
        .expect("register failed");

    let b = Barrier::create_barrier(&runtimes[0], 2, Some(REDOP_ADD), &0_i32.to_le_bytes())
        .expect("create failed");

    // Node 1 forwards its arrival to the owner; node 0 arrives locally.
    b.arrive(&runtimes[1], 1, Event::NO_EVENT, Some(&5_i32.to_le_bytes()))
        .expect("remote arrive failed");
    b.arrive(&runtimes[0], 1, Event::NO_EVENT, Some(&7_i32.to_le_bytes()))
        .expect("local arrive failed");

    let on_owner = read_i32(&runtimes[0], &b);
    assert_with_log!(on_owner == 12, "owner-side result", 12, on_owner);
    let on_remote = read_i32(&runtimes[1], &b);
    assert_with_log!(on_remote == 12, "remote-side result", 12, on_remote);

    shutdown_mesh(&runtimes);
    test_complete!("remote_arrival_publishes_on_both_nodes");
}

#[test]
fn precondition_gates_publication_across_nodes() {
    init_test_logging();
    test_phase!("precondition_gates_publication_across_nodes");
    let runtimes = test_mesh(2);
    runtimes[0]
        .register_reduction(ReductionOp::int_add(REDOP_ADD))
        .expect("register failed");

    let gate = runtimes[0].create_user_event().expect("create failed");
    let b = Barrier::create_barrier(&runtimes[0], 2, Some(REDOP_ADD), &0_i32.to_le_bytes())
        .expect("create failed");

    b.arrive(&runtimes[0], 1, gate, Some(&3_i32.to_le_bytes()))
        .expect("gated arrive failed");
    b.arrive(&runtimes[1], 1, Event::NO_EVENT, Some(&4_i32.to_le_bytes()))
        .expect("remote arrive failed");

    // Give the remote arrival time to land; the generation must still
    // be open while the gate is untriggered.
    std::thread::sleep(Duration::from_millis(50));
    let mut out = [0_u8; 4];
    assert!(
        !b.get_result(&runtimes[0], &mut out).expect("get_result failed"),
        "published before the precondition triggered"
    );

    gate.trigger(&runtimes[0]).expect("trigger failed");
    let value = read_i32(&runtimes[0], &b);
    assert_with_log!(value == 7, "gated result", 7, value);
    let remote = read_i32(&runtimes[1], &b);
    assert_with_log!(remote == 7, "remote gated result", 7, remote);

    shutdown_mesh(&runtimes);
    test_complete!("precondition_gates_publication_across_nodes");
}

#[test]
fn remote_alter_reaches_the_owner() {
    init_test_logging();
    test_phase!("remote_alter_reaches_the_owner");
    let runtimes = test_mesh(2);

    let b = Barrier::create_barrier(&runtimes[0], 2, None, b"ok").expect("create failed");
    b.arrive(&runtimes[0], 1, Event::NO_EVENT, None).expect("arrive failed");

    // Node 1 drops the expectation; the owner publishes.
    b.alter_arrival_count(&runtimes[1], -1).expect("remote alter failed");

    let mut out = [0_u8; 2];
    b.wait(&runtimes[1]).expect("remote wait failed");
    assert!(b.get_result(&runtimes[1], &mut out).expect("get_result failed"));
    assert_eq!(&out, b"ok");

    shutdown_mesh(&runtimes);
    test_complete!("remote_alter_reaches_the_owner");
}

#[test]
fn remote_event_wait_wakes_on_owner_trigger() {
    init_test_logging();
    test_phase!("remote_event_wait_wakes_on_owner_trigger");
    let runtimes = test_mesh(2);

    let e = runtimes[0].create_user_event().expect("create failed");

    // Already-triggered events answer a late remote subscription.
    e.trigger(&runtimes[0]).expect("trigger failed");
    e.wait(&runtimes[1]).expect("remote wait failed");

    // An untriggered event parks the remote waiter until the owner
    // triggers.
    let pending = runtimes[0].create_user_event().expect("create failed");
    let owner = runtimes[0].clone();
    let to_trigger = pending;
    let trigger_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        to_trigger.trigger(&owner).expect("trigger failed");
    });
    pending.wait(&runtimes[1]).expect("remote wait failed");
    trigger_thread.join().expect("trigger thread failed");

    shutdown_mesh(&runtimes);
    test_complete!("remote_event_wait_wakes_on_owner_trigger");
}

#[test]
fn shutdown_releases_every_node_once() {
    init_test_logging();
    test_phase!("shutdown_releases_every_node_once");
    let runtimes = test_mesh(3);

    // Any node may initiate; every node's wait returns.
    runtimes[1].shutdown();
    for rt in &runtimes {
        rt.wait_for_shutdown();
    }
    test_complete!("shutdown_releases_every_node_once");
}

#[test]
fn remote_spawn_is_rejected() {
    init_test_logging();
    test_phase!("remote_spawn_is_rejected");
    let runtimes = test_mesh(2);

    let remote_proc = runtimes[0]
        .machine()
        .all_processors()
        .into_iter()
        .find(|p| p.node() == lockstep::NodeId(1))
        .expect("no remote processor");
    let err = remote_proc
        .spawn(&runtimes[0], 42, &[], Event::NO_EVENT)
        .expect_err("expected err");
    assert_eq!(err.kind(), ErrorKind::RemoteSpawn);

    shutdown_mesh(&runtimes);
    test_complete!("remote_spawn_is_rejected");
}
