//! Failure handling: writer crashes and hangs, disk faults, upstream faults.

mod common;

use common::{fast_config, wait_until, CrashingOpener, FailingDiskOpener, GatedOpener, RefusingOpener};
use log2bin::source::mock::MockSource;
use log2bin::{CaptureError, CaptureSession, ShutdownReason};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn crashed_writer_is_replaced_without_losing_queued_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.bin");
    let (opener, gate) = CrashingOpener::new();
    let opener = Arc::new(opener);
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&fast_config(), path.clone(), Box::new(source))
        .with_opener(opener.clone());
    let register = Arc::clone(session.register());
    let queue = Arc::clone(session.queue());
    let trigger = session.shutdown_trigger();
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    let mut expected = Vec::new();
    for i in 0..40u8 {
        let chunk = [i, i.wrapping_mul(3), 0xAA];
        expected.extend_from_slice(&chunk);
        handle.deliver(&chunk);
    }
    assert_eq!(queue.len(), 40);

    // Generation 0 dies holding nothing; generation 1 must pick up all 40.
    drop(gate);
    wait_until("replacement drained the backlog", || {
        queue.is_empty() && register.snapshot().generation == 1
    });
    handle.deliver(b"after-restart");
    expected.extend_from_slice(b"after-restart");
    trigger.interrupt();

    let report = runner.join().unwrap().unwrap();
    assert!(matches!(report.reason, ShutdownReason::Interrupt));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.restarts, 1);
    assert_eq!(opener.opens(), 2);
    assert_eq!(report.bytes_written, expected.len() as u64);
    assert_eq!(std::fs::read(&path).unwrap(), expected);
}

#[test]
fn hung_writer_is_unstuck_and_capture_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hang.bin");
    let mut config = fast_config();
    config.pipeline.heartbeat_timeout = Duration::from_millis(60);

    let (opener, gate) = GatedOpener::new();
    let source = MockSource::new();
    let handle = source.handle();
    let session =
        CaptureSession::new(&config, path.clone(), Box::new(source)).with_opener(Arc::new(opener));
    let register = Arc::clone(session.register());
    let trigger = session.shutdown_trigger();
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    handle.deliver(b"first;");
    wait_until("heartbeat stale", || {
        !register.is_alive(Duration::from_millis(60))
    });
    // Give the supervisor time to notice and enqueue its stop request.
    thread::sleep(Duration::from_millis(200));
    drop(gate);

    wait_until("replacement writer", || register.snapshot().generation == 1);
    handle.deliver(b"second");
    thread::sleep(Duration::from_millis(50));
    trigger.interrupt();

    let report = runner.join().unwrap().unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.restarts, 1);
    assert_eq!(std::fs::read(&path).unwrap(), b"first;second");
}

#[test]
fn unopenable_output_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&fast_config(), dir.path().join("ro.bin"), Box::new(source))
        .with_opener(Arc::new(RefusingOpener));
    let report = session.run().unwrap();

    match &report.reason {
        ShutdownReason::Fatal(CaptureError::FileOpen { attempts, .. }) => assert_eq!(*attempts, 3),
        other => panic!("unexpected reason: {other:?}"),
    }
    assert_eq!(report.exit_code(), 1);
    assert!(!handle.is_open());
    assert!(report
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("volume is read-only"));
}

#[test]
fn failed_reopen_after_write_error_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("detached.bin");
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&fast_config(), path.clone(), Box::new(source))
        .with_opener(Arc::new(FailingDiskOpener::new(2)));
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    for chunk in [b"one".as_slice(), b"two", b"three", b"four"] {
        handle.deliver(chunk);
    }

    let report = runner.join().unwrap().unwrap();
    assert!(matches!(
        report.reason,
        ShutdownReason::Fatal(CaptureError::FileWrite { .. })
    ));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(std::fs::read(&path).unwrap(), b"onetwo");
}

#[test]
fn upstream_error_is_fatal_after_draining() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upstream.bin");
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&fast_config(), path.clone(), Box::new(source));
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    handle.deliver(b"good bytes");
    handle.raise_error(12, "buffer overrun");

    let report = runner.join().unwrap().unwrap();
    match &report.reason {
        ShutdownReason::Fatal(CaptureError::UpstreamRuntime { code, message }) => {
            assert_eq!(*code, 12);
            assert_eq!(message, "buffer overrun");
        }
        other => panic!("unexpected reason: {other:?}"),
    }
    assert_eq!(report.bridge.upstream_errors, 1);
    assert_eq!(report.exit_code(), 1);
    assert!(!handle.is_open());
    assert_eq!(std::fs::read(&path).unwrap(), b"good bytes");
}

#[test]
fn upstream_open_failure_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new().failing_open(-3);
    let report = CaptureSession::new(&fast_config(), dir.path().join("x.bin"), Box::new(source))
        .run()
        .unwrap();

    assert!(matches!(
        report.reason,
        ShutdownReason::Fatal(CaptureError::UpstreamOpen { code: -3, ref port }) if port == "MOCK0"
    ));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn restart_budget_exhaustion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.pipeline.max_restarts = 0;
    let (opener, gate) = CrashingOpener::new();
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&config, dir.path().join("budget.bin"), Box::new(source))
        .with_opener(Arc::new(opener));
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    handle.deliver(b"at risk");
    drop(gate);

    let report = runner.join().unwrap().unwrap();
    assert!(matches!(
        report.reason,
        ShutdownReason::Fatal(CaptureError::RestartBudgetExhausted { restarts: 0 })
    ));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn writer_that_never_finishes_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.pipeline.heartbeat_timeout = Duration::from_secs(60);
    config.pipeline.shutdown_join_timeout = Duration::from_millis(30);
    config.pipeline.shutdown_retry_join_timeout = Duration::from_millis(30);

    let (opener, gate) = GatedOpener::new();
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&config, dir.path().join("stuck.bin"), Box::new(source))
        .with_opener(Arc::new(opener));
    let register = Arc::clone(session.register());
    let trigger = session.shutdown_trigger();
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    handle.deliver(b"stuck");
    thread::sleep(Duration::from_millis(30));
    trigger.interrupt();

    let report = runner.join().unwrap().unwrap();
    assert!(!report.writer_terminated);
    assert_eq!(report.exit_code(), 1);

    // The abandoned writer still finishes cleanly once unblocked.
    drop(gate);
    wait_until("abandoned writer stopped", || !register.snapshot().running);
}

#[test]
fn interrupt_during_restart_backoff_still_drains_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backoff.bin");
    let mut config = fast_config();
    config.pipeline.restart_backoff_first = Duration::from_secs(60);
    config.pipeline.restart_backoff_max = Duration::from_secs(60);

    let (opener, gate) = CrashingOpener::with_crashes(2);
    let opener = Arc::new(opener);
    let source = MockSource::new();
    let handle = source.handle();
    let session =
        CaptureSession::new(&config, path.clone(), Box::new(source)).with_opener(opener.clone());
    let register = Arc::clone(session.register());
    let trigger = session.shutdown_trigger();
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    for i in 0..10u8 {
        handle.deliver(&[i]);
    }
    // Generation 0 and its immediate replacement both crash; the next
    // replacement is held back by the 60 s backoff.
    drop(gate);
    wait_until("second crash reaped", || {
        opener.opens() == 2 && !register.snapshot().running
    });
    trigger.interrupt();

    let report = runner.join().unwrap().unwrap();
    assert!(matches!(report.reason, ShutdownReason::Interrupt));
    assert!(report.writer_terminated);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.restarts, 2);
    assert_eq!(std::fs::read(&path).unwrap(), (0..10u8).collect::<Vec<_>>());
}

#[cfg(target_os = "linux")]
#[test]
fn full_device_at_shutdown_exits_nonzero() {
    let source = MockSource::new();
    let handle = source.handle();
    let session = CaptureSession::new(&fast_config(), "/dev/full".into(), Box::new(source));
    let trigger = session.shutdown_trigger();
    let runner = thread::spawn(move || session.run());
    wait_until("source open", || handle.is_open());

    for _ in 0..10 {
        handle.deliver(&[0x5A; 1000]);
    }
    thread::sleep(Duration::from_millis(30));
    trigger.interrupt();

    let report = runner.join().unwrap().unwrap();
    assert!(matches!(
        report.reason,
        ShutdownReason::Fatal(CaptureError::FileWrite { .. })
    ));
    assert_eq!(report.exit_code(), 1);
    assert!(report
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("No space left"));
}
