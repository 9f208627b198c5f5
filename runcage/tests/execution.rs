//! Integration tests for the pieces that run without root: configuration
//! round-trips, the report contract, and target execution with deadlines.

use runcage::Config;
use runcage::jailer::exec::{self, TIME_LIMIT_EXCEEDED};
use runcage_shared::Report;

// ============================================================================
// TEST FIXTURES
// ============================================================================

const FULL_CONFIG: &str = r#"
envs:
  PATH: /usr/bin:/bin
  HOME: /tmp
namespaces: [CGROUP, UTS, IPC, MNT, USER, PID, NET]
rlimits:
  - resource: NOFILE
    soft: 256
    hard: 256
  - resource: FSIZE
    soft: 1048576
    hard: 1048576
seccomp:
  default_action: allow
  syscalls:
    - names: [ptrace, process_vm_readv, process_vm_writev]
      action: kill_process
cgroup:
  max_memory: 64m
  max_pids: 32
  max_depth: 2
  max_descendants: 8
  cpu:
    time: 50000
    period: 100000
    weight: 100
binds:
  - source: /opt/toolchain
    target: /opt/toolchain
files: ["r:/usr", "rwc:/tmp"]
landlock:
  tmp: true
  shared: true
user: nobody
group: nogroup
time_limit: 5
"#;

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

// ============================================================================
// CONFIGURATION ROUND-TRIP
// ============================================================================

#[test]
fn full_config_decodes_and_roundtrips() {
    let config = Config::from_slice(FULL_CONFIG.as_bytes()).unwrap();
    assert_eq!(config.namespaces.len(), 7);
    assert_eq!(config.rlimits.len(), 2);
    assert_eq!(config.seccomp.syscalls[0].names.len(), 3);
    assert_eq!(config.cgroup.cpu.period, 100_000);
    assert!(config.landlock.shared);

    // Decoding and re-emitting yields a logically equivalent document.
    let reencoded = config.to_yaml().unwrap();
    let back = Config::from_slice(reencoded.as_bytes()).unwrap();
    assert_eq!(back, config);
}

#[test]
fn json_document_is_accepted() {
    let doc = r#"{"envs":{"A":"x"},"namespaces":["USER","MNT","PID"],"time_limit":5}"#;
    let config = Config::from_slice(doc.as_bytes()).unwrap();
    assert_eq!(config.envs["A"], "x");
    assert_eq!(config.time_limit, 5);
}

// ============================================================================
// TARGET EXECUTION
// ============================================================================

#[test]
fn clean_run_reports_output_and_zero_exit() {
    let (report, code) = exec::run_target(&sh("echo hi"), 5).unwrap();
    assert_eq!(code, 0);
    assert_eq!(report.output, "hi\n");
    assert!(report.message.is_empty());
    assert_eq!(report.metric.exit_code, 0);
    assert_eq!(report.metric.signal, None);
}

#[test]
fn fatal_signal_is_reported_not_an_error() {
    let (report, code) = exec::run_target(&sh("kill -9 $$"), 5).unwrap();
    assert_eq!(code, -1);
    assert_eq!(report.metric.signal, Some(libc::SIGKILL));
    assert_eq!(report.metric.exit_code, -1);
}

#[test]
fn deadline_expiry_tags_and_kills() {
    let (report, _code) = exec::run_target(&sh("sleep 30"), 1).unwrap();
    assert!(report.message.contains(&TIME_LIMIT_EXCEEDED.to_string()));
    assert_eq!(report.metric.signal, Some(libc::SIGKILL));
    assert!(report.metric.wall_time >= 1_000_000_000);
}

#[test]
fn rusage_accounting_is_present() {
    let (report, _code) = exec::run_target(&sh("head -c 4000000 /dev/zero | wc -c"), 10).unwrap();
    assert!(report.metric.memory > 0, "maxrss should be nonzero");
    assert!(report.metric.wall_time > 0);
}

// ============================================================================
// REPORT CONTRACT
// ============================================================================

#[test]
fn report_line_parses_back() {
    let (report, _code) = exec::run_target(&sh("echo out; echo err 1>&2"), 5).unwrap();
    let line = report.to_json_line().unwrap();
    let back: Report = serde_json::from_str(&line).unwrap();
    assert_eq!(back.output, "out\nerr\n");

    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    for key in ["signal", "exit_code", "sys_time", "time", "wall_time", "memory"] {
        assert!(
            value["metric"].get(key).is_some(),
            "metric is missing {}",
            key
        );
    }
}
