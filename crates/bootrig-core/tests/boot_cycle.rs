//! Boot-cycle integration tests.
//!
//! Plain shell commands stand in for the hypervisor (via the per-VM command
//! override), so these tests exercise the full launch → monitor → supervise
//! path without QEMU or images.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bootrig_core::{
    BootOutcome, DefaultsConfig, Harness, HarnessConfig, HarnessError, TriggerVerdict, Vm,
    VmConfig,
};

fn sh_config(script: &str) -> VmConfig {
    VmConfig {
        command: vec!["sh".into(), "-c".into(), script.into()],
        ..Default::default()
    }
}

fn sh_vm(script: &str) -> Vm {
    Vm::new(sh_config(script), &HarnessConfig::default())
}

const BOOT_BUDGET: Duration = Duration::from_secs(10);

// ============================================================================
// Trigger protocol
// ============================================================================

#[tokio::test]
async fn test_trigger_fires_once_and_drives_guest_input() {
    let mut vm = sh_vm("echo trigger_test_serial_port\nread reply\necho \"got $reply\"");
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    vm.on_output("trigger_test_serial_port", move |_line, console| {
        counter.fetch_add(1, Ordering::SeqCst);
        console.write_line("Here is a test")?;
        Ok(TriggerVerdict::Continue)
    })
    .expect("failed to register trigger");

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");
    vm.clean();

    assert!(result.is_success(), "expected success: {}", result.outcome);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(fired.load(Ordering::SeqCst), 1, "callback should fire exactly once");
    assert_eq!(
        result.transcript,
        vec!["trigger_test_serial_port", "got Here is a test"],
        "transcript should contain the trigger exchange and nothing else"
    );
}

#[tokio::test]
async fn test_first_registered_trigger_wins_on_shared_line() {
    let mut vm = sh_vm("echo \"alpha beta\"");
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first);
    vm.on_output("beta", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(TriggerVerdict::Continue)
    })
    .unwrap();

    let counter = Arc::clone(&second);
    vm.on_output("alpha", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(TriggerVerdict::Continue)
    })
    .unwrap();

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");

    assert!(result.is_success());
    assert_eq!(first.load(Ordering::SeqCst), 1, "first-registered should fire");
    assert_eq!(second.load(Ordering::SeqCst), 0, "second should not fire");
}

#[tokio::test]
async fn test_early_success_verdict_terminates_process() {
    let mut vm = sh_vm("echo boot done\nsleep 30");
    vm.on_output("boot done", |_, _| Ok(TriggerVerdict::Success))
        .unwrap();

    let start = Instant::now();
    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");

    assert!(result.is_success(), "expected success: {}", result.outcome);
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "early verdict should not wait for the guest to exit"
    );
}

#[tokio::test]
async fn test_failing_callback_fails_the_cycle() {
    let mut vm = sh_vm("echo checkpoint\nsleep 30");
    vm.on_output("checkpoint", |_, _| {
        Err(HarnessError::Trigger("deliberate callback failure".into()))
    })
    .unwrap();

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");

    match &result.outcome {
        BootOutcome::Failure(reason) => {
            assert!(reason.contains("deliberate callback failure"), "got: {reason}");
        }
        other => panic!("expected failure outcome, got {other}"),
    }
}

// ============================================================================
// Marker patterns
// ============================================================================

#[tokio::test]
async fn test_pass_marker_ends_cycle_successfully() {
    let config = HarnessConfig {
        defaults: DefaultsConfig {
            pass_patterns: vec!["ALL TESTS PASSED".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let mut vm = Vm::new(sh_config("echo ALL TESTS PASSED\nsleep 30"), &config);

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");
    assert!(result.is_success(), "expected success: {}", result.outcome);
}

#[tokio::test]
async fn test_fail_marker_fails_cycle() {
    let config = HarnessConfig {
        defaults: DefaultsConfig {
            fail_patterns: vec!["PANIC".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let mut vm = Vm::new(
        sh_config("echo \"PANIC: unhandled exception\"\nsleep 30"),
        &config,
    );

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");
    match &result.outcome {
        BootOutcome::Failure(reason) => assert!(reason.contains("PANIC"), "got: {reason}"),
        other => panic!("expected failure outcome, got {other}"),
    }
}

// ============================================================================
// Exit codes and timeouts
// ============================================================================

#[tokio::test]
async fn test_nonzero_exit_is_a_failure_with_exit_code() {
    let mut vm = sh_vm("echo winding down\nexit 7");

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");

    assert!(matches!(result.outcome, BootOutcome::Failure(_)));
    assert_eq!(result.exit_code, Some(7));
    assert_eq!(result.transcript, vec!["winding down"]);
}

#[tokio::test]
async fn test_timeout_kills_hung_process_and_never_fires_early() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("hypervisor.pid");
    let mut vm = sh_vm(&format!("echo $$ > {}\nsleep 30", pid_file.display()));

    let start = Instant::now();
    let result = vm
        .boot(Some(Duration::from_secs(1)))
        .await
        .expect("boot failed");
    let elapsed = start.elapsed();

    assert_eq!(result.outcome, BootOutcome::Timeout { secs: 1 });
    assert!(elapsed >= Duration::from_secs(1), "timeout fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "timeout overshot: {elapsed:?}");

    // The hypervisor must not linger after a timeout.
    let pid: i32 = std::fs::read_to_string(&pid_file)
        .expect("pid file should exist")
        .trim()
        .parse()
        .expect("pid file should hold a pid");
    let probe = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
    assert!(probe.is_err(), "process {pid} is still alive after timeout");
}

// ============================================================================
// Transcript ordering
// ============================================================================

#[tokio::test]
async fn test_transcript_preserves_emission_order() {
    let mut vm = sh_vm("i=1\nwhile [ $i -le 25 ]; do echo line $i; i=$((i+1)); done");

    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");

    let expected: Vec<String> = (1..=25).map(|i| format!("line {i}")).collect();
    assert_eq!(result.transcript, expected);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_clean_is_idempotent_after_boot() {
    let mut vm = sh_vm("exit 0");
    let result = vm.boot(Some(BOOT_BUDGET)).await.expect("boot failed");
    assert!(result.is_success());

    vm.clean();
    vm.clean();
}

#[tokio::test]
async fn test_rearmed_vm_fires_trigger_once_per_cycle() {
    let mut vm = sh_vm("echo ready");
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    vm.on_output("ready", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(TriggerVerdict::Continue)
    })
    .unwrap();

    vm.boot(Some(BOOT_BUDGET)).await.expect("first boot failed");
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    vm.rearm().expect("rearm failed");
    vm.boot(Some(BOOT_BUDGET)).await.expect("second boot failed");
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_registry_vms_boot_concurrently_and_independently() {
    let config = HarnessConfig {
        vms: vec![
            sh_config("echo first up\nexit 0"),
            sh_config("echo second up\nexit 1"),
        ],
        ..Default::default()
    };
    let mut harness = Harness::from_config(config);

    let (left, right) = harness.vms_mut().split_at_mut(1);
    let (first, second) = tokio::join!(
        left[0].boot(Some(BOOT_BUDGET)),
        right[0].boot(Some(BOOT_BUDGET)),
    );

    let first = first.expect("first boot failed");
    let second = second.expect("second boot failed");

    assert!(first.is_success());
    assert_eq!(first.transcript, vec!["first up"]);
    // One VM's failure does not touch the other's result.
    assert!(matches!(second.outcome, BootOutcome::Failure(_)));
    assert_eq!(second.exit_code, Some(1));

    harness.teardown();
}
