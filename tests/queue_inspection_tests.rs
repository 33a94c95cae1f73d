//! Integration tests for ring queue and slot table inspection

mod utils;

use ltscope::scheduler::{LthreadHandle, QueueKind};
use ltscope::InspectError;
use utils::TargetBuilder;

#[test]
fn test_run_queue_wraps_through_mask() {
    // E=10, D=7, M=3: positions 7,8,9 live in slots 3,0,1
    let mut target = TargetBuilder::new();
    let a = target.lthread(1, 0, "a");
    let b = target.lthread(2, 0, "b");
    let c = target.lthread(3, 1, "c");
    target.ring_queue(QueueKind::Run, 10, 7, 3, &[(3, a), (0, b), (1, c)]);
    let mut session = target.session();

    let walk = session.queue_threads(QueueKind::Run).unwrap();
    assert_eq!(
        walk.threads,
        vec![LthreadHandle(a), LthreadHandle(b), LthreadHandle(c)]
    );
    assert!(walk.diagnostics.is_empty());
    let queue = walk.queue.unwrap();
    let slots: Vec<u64> = queue.slots().unwrap().iter().map(|s| s.slot).collect();
    assert_eq!(slots, vec![3, 0, 1]);
}

#[test]
fn test_dequeue_ahead_of_enqueue_yields_nothing() {
    let mut target = TargetBuilder::new();
    let a = target.lthread(1, 0, "a");
    target.ring_queue(QueueKind::Run, 3, 4, 7, &[(3, a)]);
    let mut session = target.session();

    let err = session.queue_threads(QueueKind::Run).unwrap_err();
    assert!(matches!(
        err,
        InspectError::QueueInvariantViolation {
            enqueue_pos: 3,
            dequeue_pos: 4,
            ..
        }
    ));
    assert!(session.queue_stats().is_err());
}

#[test]
fn test_syscall_queue_resolves_through_slot_table() {
    // E=5, D=2, M=1: positions 2,3,4 map to cells 0,1,0
    let mut target = TargetBuilder::new();
    let first = target.lthread(10, 0, "first");
    let second = target.lthread(11, 0, "second");
    target.slot_table(&[first, second], &[202, 0]);
    target.ring_queue(QueueKind::SyscallRequest, 5, 2, 1, &[(0, 0), (1, 1)]);
    let mut session = target.session();

    let walk = session.queue_threads(QueueKind::SyscallRequest).unwrap();
    assert_eq!(
        walk.threads,
        vec![
            LthreadHandle(first),
            LthreadHandle(second),
            LthreadHandle(first)
        ]
    );
}

#[test]
fn test_empty_slot_is_reported_and_skipped() {
    let mut target = TargetBuilder::new();
    let owner = target.lthread(10, 0, "owner");
    target.slot_table(&[owner, 0], &[1, 0]);
    target.ring_queue(QueueKind::SyscallReturn, 2, 0, 3, &[(0, 1), (1, 0)]);
    let mut session = target.session();

    let walk = session.queue_threads(QueueKind::SyscallReturn).unwrap();
    assert_eq!(walk.threads, vec![LthreadHandle(owner)]);
    assert_eq!(walk.diagnostics.len(), 1);
    assert!(matches!(
        walk.diagnostics[0],
        InspectError::MissingThreadForSlot {
            position: 0,
            slot: 1,
            ..
        }
    ));
}

#[test]
fn test_queue_stats_counts_every_queue() {
    let mut target = TargetBuilder::new();
    let lt = target.lthread(1, 0, "lt");
    target.ring_queue(QueueKind::Run, 12, 9, 7, &[]);
    target.ring_queue(QueueKind::SyscallRequest, 4, 4, 7, &[]);
    target.ring_queue(QueueKind::SyscallReturn, 1, 0, 7, &[]);
    target.futex_list(&[(1, lt, 0), (2, lt, 0)]);
    let mut session = target.session();

    let stats = session.queue_stats().unwrap();
    assert_eq!(stats.run_queue, 3);
    assert_eq!(stats.syscall_request_queue, 0);
    assert_eq!(stats.syscall_return_queue, 1);
    assert_eq!(stats.futex_waiters, 2);
    assert_eq!(stats.total(), 6);
}

#[test]
fn test_absurd_occupancy_hits_traversal_limit() {
    let mut target = TargetBuilder::new();
    target.config.limits.max_queue_walk = 16;
    target.ring_queue(QueueKind::Run, 1000, 0, 7, &[]);
    let mut session = target.session();

    let err = session.queue_threads(QueueKind::Run).unwrap_err();
    assert!(matches!(err, InspectError::TraversalLimit { .. }));
}

#[test]
fn test_occupied_slots() {
    let mut target = TargetBuilder::new();
    let lt = target.lthread(42, 2, "sys");
    target.slot_table(&[0, lt, 0], &[0, 60, 0]);
    let mut session = target.session();

    let slots = session.occupied_slots().unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].slot, 1);
    assert_eq!(slots[0].lthread, LthreadHandle(lt));
    assert_eq!(slots[0].syscallno, 60);
}

#[test]
fn test_active_lthreads_in_list_order() {
    let mut target = TargetBuilder::new();
    let a = target.lthread(1, 0, "a");
    let b = target.lthread(2, 0, "b");
    target.active_list(&[b, a]);
    let mut session = target.session();

    assert_eq!(
        session.active_lthreads().unwrap(),
        vec![LthreadHandle(b), LthreadHandle(a)]
    );
    let info = session.lthread_info(LthreadHandle(b)).unwrap();
    assert_eq!(info.tid, 2);
    assert_eq!(info.name, "b");
}
