//! オブジェクトの neuter と回収のテスト

use hashi_core::{Capability, DebugError, ManagedEvent, Process, ProcessConfig};
use hashi_target::{AgentBehavior, MemoryAccessor, TargetHandle, INT3_OPCODE};
use std::thread;
use std::time::Duration;

/// コード領域の初期値（NOP）
const NOP: u8 = 0x90;

fn stopped_session() -> (TargetHandle, Process) {
    let target = TargetHandle::launch(AgentBehavior::default()).expect("Failed to launch loopback target");
    let config = ProcessConfig::default().with_reply_timeout(Duration::from_secs(2));
    let process = Process::connect(&target, config).expect("Failed to connect");
    process.stop(Duration::from_secs(2)).expect("stop should succeed");
    (target, process)
}

#[test]
fn test_neuter_after_inspection() {
    let (target, process) = stopped_session();
    let events = process.managed_events();
    let address = target.code_base() + 0x40;

    let bp = process.create_breakpoint_at_address(address).unwrap();
    assert_eq!(bp.address(), Ok(address));

    target.exit(0);
    let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event, ManagedEvent::ProcessExited { code: Some(0) });

    // neuter 後は参照数の操作と能力の問い合わせだけが成功する
    assert!(bp.is_neutered());
    assert_eq!(bp.address(), Err(DebugError::Disposed));
    assert_eq!(bp.is_active(), Err(DebugError::Disposed));
    assert!(bp.supports(Capability::Breakpoint));
    let copy = bp.clone();
    drop(bp);
    assert_eq!(copy.remote_handle(), Err(DebugError::Disposed));
    drop(copy);
}

#[test]
fn test_released_breakpoint_is_swept_on_continue() {
    let (target, process) = stopped_session();
    let address = target.code_base() + 0x10;
    let before = process.stats();

    let bp = process.create_breakpoint_at_address(address).unwrap();
    assert_eq!(target.memory().read(address, 1).unwrap(), vec![INT3_OPCODE]);
    drop(bp);

    // 外部参照が0になっても、Continue までは破棄されない
    assert_eq!(target.memory().read(address, 1).unwrap(), vec![INT3_OPCODE]);
    assert_eq!(process.stats().disposed, before.disposed);

    process.continue_(false).unwrap();
    assert_eq!(target.memory().read(address, 1).unwrap(), vec![NOP]);

    let after = process.stats();
    assert_eq!(after.created, before.created + 1);
    assert_eq!(after.disposed, before.disposed + 1);
    assert_eq!(after.live, before.live);
}

#[test]
fn test_held_breakpoint_survives_continue() {
    let (target, process) = stopped_session();
    let address = target.code_base() + 0x18;
    let bp = process.create_breakpoint_at_address(address).unwrap();

    process.continue_(false).unwrap();
    assert_eq!(bp.address(), Ok(address));
    assert_eq!(bp.is_active(), Ok(true));
    assert_eq!(target.memory().read(address, 1).unwrap(), vec![INT3_OPCODE]);
}

#[test]
fn test_enumerator_is_invalidated_by_continue() {
    let (target, process) = stopped_session();
    let first = process.create_breakpoint_at_address(target.code_base()).unwrap();
    let second = process.create_breakpoint_at_address(target.code_base() + 8).unwrap();

    let breakpoints = process.enumerate_breakpoints().unwrap();
    assert!(breakpoints.supports(Capability::TypedEnumerator));
    assert_eq!(breakpoints.count(), Ok(2));
    let listed = breakpoints.collect_remaining().unwrap();
    let ids: Vec<_> = listed.iter().map(|bp| bp.id()).collect();
    assert_eq!(ids, vec![first.id(), second.id()]);

    breakpoints.reset().unwrap();
    breakpoints.skip(1).unwrap();
    assert_eq!(breakpoints.next().unwrap().map(|bp| bp.id()), Some(second.id()));

    process.continue_(false).unwrap();
    assert_eq!(breakpoints.next().err(), Some(DebugError::Disposed));
    assert_eq!(breakpoints.count(), Err(DebugError::Disposed));
    assert!(breakpoints.supports(Capability::Enumerator));

    // 列挙で得たハンドルは列挙子とは独立に有効
    assert_eq!(listed[0].address(), Ok(target.code_base()));
}

#[test]
fn test_at_will_snapshot_is_swept() {
    let (target, process) = stopped_session();
    let kept = process.snapshot_memory(target.code_base(), 8).unwrap();
    let dropped = process.snapshot_memory(target.code_base() + 8, 8).unwrap();
    assert_eq!(kept.bytes(), Ok(vec![NOP; 8]));
    let live_before = process.live_objects();
    drop(dropped);

    // 回収は Continue の掃除で一度だけ行われる
    assert_eq!(process.live_objects(), live_before);
    process.continue_(false).unwrap();
    assert_eq!(process.live_objects(), live_before - 1);
    assert_eq!(kept.read(2, 4), Ok(vec![NOP; 4]));
    assert_eq!(kept.read(6, 4), Err(DebugError::InvalidOperation("read outside the snapshot")));
}

#[test]
fn test_write_preserves_patch() {
    let (target, process) = stopped_session();
    let address = target.code_base() + 0x21;
    let bp = process.create_breakpoint_at_address(address).unwrap();

    process.write_memory(address - 1, &[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(
        target.memory().read(address - 1, 3).unwrap(),
        vec![0x01, INT3_OPCODE, 0x03]
    );
    assert_eq!(process.read_memory(address - 1, 3).unwrap(), vec![0x01, 0x02, 0x03]);

    // ブレークポイントを外すと、書き込んだ値が元のオペコードとして戻る
    drop(bp);
    process.continue_(false).unwrap();
    assert_eq!(target.memory().read(address, 1).unwrap(), vec![0x02]);
}

#[test]
fn test_detach_neuters_everything() {
    let (target, process) = stopped_session();
    let events = process.managed_events();
    let address = target.code_base() + 0x30;
    let bp = process.create_breakpoint_at_address(address).unwrap();
    let snapshot = process.snapshot_memory(address, 4).unwrap();

    process.detach().unwrap();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(2)).unwrap(),
        ManagedEvent::ProcessDetached
    );
    assert_eq!(bp.address(), Err(DebugError::Disposed));
    assert_eq!(snapshot.bytes(), Err(DebugError::Disposed));
    assert_eq!(target.memory().read(address, 1).unwrap(), vec![NOP]);

    assert_eq!(process.stop(Duration::from_millis(50)), Err(DebugError::Detached));
    assert_eq!(process.detach(), Err(DebugError::Detached));
}

#[test]
fn test_breakpoint_outside_code_is_rejected() {
    let (target, process) = stopped_session();
    let outside = target.memory().base();
    assert_eq!(
        process.create_breakpoint_at_address(outside).err(),
        Some(DebugError::InvalidOperation("left side rejected the breakpoint"))
    );
}

#[test]
fn test_concurrent_handle_traffic_disposes_once() {
    let (target, process) = stopped_session();
    let before = process.stats();
    let live_before = process.live_objects();

    let bp = process.create_breakpoint_at_address(target.code_base() + 0x70).unwrap();
    let snapshot = process.snapshot_memory(target.code_base() + 0x70, 8).unwrap();
    thread::scope(|scope| {
        for worker in 0..8 {
            let (bp, snapshot) = (&bp, &snapshot);
            scope.spawn(move || {
                let mut held = Vec::new();
                for round in 0..200 {
                    held.push((bp.clone(), snapshot.clone()));
                    if (round + worker) % 3 == 0 {
                        held.clear();
                    }
                }
                assert_eq!(bp.is_active(), Ok(true));
            });
        }
    });
    drop(bp);
    drop(snapshot);

    // 解放は Continue の掃除まで遅れ、それぞれちょうど一度だけ破棄される
    assert_eq!(process.stats().disposed, before.disposed);
    process.continue_(false).unwrap();
    let after = process.stats();
    assert_eq!(after.created, before.created + 2);
    assert_eq!(after.disposed, before.disposed + 2);
    assert_eq!(after.live, before.live);
    assert_eq!(process.live_objects(), live_before);
}

#[test]
fn test_enumerators_created_during_continue_are_neutered() {
    let (target, process) = stopped_session();
    // Continue 中に左側資源の解放が走るよう、外部参照を手放したブレークポイントを残す
    for slot in 0..8 {
        drop(process.create_breakpoint_at_address(target.code_base() + slot * 8).unwrap());
    }

    let enumerators = thread::scope(|scope| {
        let worker = scope.spawn(|| {
            let mut made = Vec::new();
            loop {
                match process.enumerate_breakpoints() {
                    Ok(enumerator) => made.push(enumerator),
                    Err(e) => {
                        assert_eq!(e, DebugError::NotSynchronized);
                        break made;
                    }
                }
            }
        });
        process.continue_(false).unwrap();
        worker.join().expect("enumerating thread panicked")
    });

    println!("{} enumerator(s) created before the continue", enumerators.len());
    assert!(!process.is_synchronized());
    for enumerator in &enumerators {
        assert!(enumerator.is_neutered());
        assert_eq!(enumerator.count(), Err(DebugError::Disposed));
    }
}
