//! 停止・再開の同期のテスト（ループバックのデバッグ対象を使う）

use hashi_core::{DebugError, ManagedEvent, Process, ProcessConfig, SyncState};
use hashi_target::{AgentBehavior, TargetHandle};
use std::time::{Duration, Instant};

fn launch(stop_latency: Option<Duration>) -> (TargetHandle, Process) {
    let behavior = AgentBehavior {
        stop_latency,
        ..Default::default()
    };
    let target = TargetHandle::launch(behavior).expect("Failed to launch loopback target");
    let config = ProcessConfig::default().with_reply_timeout(Duration::from_secs(2));
    let process = Process::connect(&target, config).expect("Failed to connect");
    (target, process)
}

#[test]
fn test_stop_within_timeout() {
    let (_target, process) = launch(Some(Duration::from_millis(50)));

    let start = Instant::now();
    process.stop(Duration::from_millis(1000)).expect("stop should succeed");
    println!("stopped after {:?}", start.elapsed());

    assert!(process.is_synchronized());
    assert_eq!(process.sync_state(), SyncState::Synchronized);
    assert_eq!(process.stop_count(), 1);
}

#[test]
fn test_stop_times_out_without_report() {
    let (_target, process) = launch(None);

    let start = Instant::now();
    let result = process.stop(Duration::from_millis(50));
    assert_eq!(result, Err(DebugError::Timeout(Duration::from_millis(50))));
    assert!(start.elapsed() >= Duration::from_millis(50));

    // タイムアウトした停止は状態を変えない
    assert!(!process.is_synchronized());
    assert_eq!(process.sync_state(), SyncState::Running);
    assert_eq!(process.stop_count(), 0);
    assert_eq!(process.continue_(false), Err(DebugError::NotSynchronized));
}

#[test]
fn test_nested_stop_and_continue() {
    let (_target, process) = launch(Some(Duration::from_millis(5)));

    process.stop(Duration::from_secs(2)).unwrap();
    process.stop(Duration::from_secs(2)).unwrap();
    assert_eq!(process.stop_count(), 2);

    process.continue_(false).unwrap();
    assert!(process.is_synchronized());
    assert_eq!(process.stop_count(), 1);

    process.continue_(false).unwrap();
    assert!(!process.is_synchronized());
    assert_eq!(process.stop_count(), 0);

    assert_eq!(process.continue_(false), Err(DebugError::NotSynchronized));
}

#[test]
fn test_late_stop_report_is_released() {
    let (_target, process) = launch(Some(Duration::from_millis(150)));

    assert!(matches!(
        process.stop(Duration::from_millis(20)),
        Err(DebugError::Timeout(_))
    ));

    // 遅れて届いた停止報告では同期状態にならない
    std::thread::sleep(Duration::from_millis(300));
    assert!(!process.is_synchronized());
    assert_eq!(process.stop_count(), 0);

    // 次の停止は普通に成功する
    process.stop(Duration::from_secs(2)).unwrap();
    assert_eq!(process.stop_count(), 1);
}

#[test]
fn test_user_breakpoint_stops_process() {
    let (target, process) = launch(None);
    let events = process.managed_events();

    target.raise_user_breakpoint(5);
    let event = events
        .recv_timeout(Duration::from_secs(2))
        .expect("Expected a user breakpoint event");
    assert_eq!(event, ManagedEvent::UserBreakpoint { thread: 5 });
    assert!(process.is_synchronized());
    assert_eq!(process.stop_count(), 1);

    process.continue_(false).unwrap();
    assert!(!process.is_synchronized());
}

#[test]
fn test_exit_latches_terminated() {
    let (target, process) = launch(Some(Duration::from_millis(5)));
    let events = process.managed_events();

    target.exit(3);
    let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event, ManagedEvent::ProcessExited { code: Some(3) });

    assert_eq!(process.stop(Duration::from_millis(100)), Err(DebugError::Terminated));
    assert_eq!(process.continue_(false), Err(DebugError::Terminated));
    assert_eq!(process.read_memory(target.code_base(), 1), Err(DebugError::Terminated));
}

#[test]
fn test_transport_death_is_exit() {
    let (target, process) = launch(Some(Duration::from_millis(5)));
    let events = process.managed_events();

    target.kill();
    let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event, ManagedEvent::ProcessExited { code: None });
    assert!(!process.is_synchronized());
    assert_eq!(process.stop(Duration::from_millis(100)), Err(DebugError::Terminated));
}

#[test]
fn test_unrecoverable_error_wins() {
    let (target, process) = launch(Some(Duration::from_millis(5)));
    let events = process.managed_events();
    process.mark_unrecoverable("corrupt event stream");

    let expected = Err(DebugError::Unrecoverable("corrupt event stream".into()));
    assert_eq!(process.stop(Duration::from_millis(100)), expected);

    // 終了しても回復不能エラーが優先される
    target.exit(0);
    events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(process.continue_(false), expected);
}

#[test]
fn test_user_breakpoint_completing_stop_is_not_reported() {
    let (target, process) = launch(None);
    let events = process.managed_events();

    std::thread::scope(|scope| {
        let stopper = scope.spawn(|| process.stop(Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.sync_state() != SyncState::Synchronizing {
            assert!(Instant::now() < deadline, "stop never started");
            std::thread::sleep(Duration::from_millis(1));
        }
        target.raise_user_breakpoint(4);
        stopper.join().expect("stop thread panicked").expect("stop should succeed");
    });

    // 停止カウントは Stop の呼び出し側のもので、Continue の依頼は届かない
    assert_eq!(process.stop_count(), 1);
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    process.continue_(false).unwrap();
    assert!(!process.is_synchronized());
}
