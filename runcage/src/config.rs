//! The sandbox configuration document.
//!
//! YAML is the canonical encoding; JSON parses as a YAML subset, so one
//! decoder serves both. Unknown mapping keys are ignored for forward
//! compatibility, but unknown enumerators (namespace names, rlimit
//! resources, seccomp actions) are decode errors — a typo there would
//! silently weaken the cage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::jailer::rlimit::Rlimit;
use crate::jailer::seccomp::{Action, Policy};
use crate::sandbox::namespaces::Namespace;
use runcage_shared::{RuncageError, RuncageResult};

/// Default size of the `/tmp` tmpfs inside the root.
const DEFAULT_TMP_SIZE: &str = "64m";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The target's entire environment. Inherited variables are cleared.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    /// Namespaces to unshare for the jailer and target.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,

    /// POSIX resource limits, applied in order by the jailer.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,

    /// Seccomp policy, loaded last among restrictions.
    #[serde(default)]
    pub seccomp: Policy,

    /// cgroup-v2 resource limits.
    #[serde(default)]
    pub cgroup: CgroupLimits,

    /// Additional bind mounts into the root.
    #[serde(default)]
    pub binds: Vec<BindMount>,

    /// Landlock path rules, `"<flags>:<path>"` with flags ⊆ {r,w,x,c}.
    #[serde(default)]
    pub files: Vec<String>,

    /// Well-known Landlock read sets.
    #[serde(default)]
    pub landlock: LandlockSets,

    /// User name resolved against the host passwd for the id mapping.
    #[serde(default)]
    pub user: String,

    /// Group name resolved against the host group database.
    #[serde(default)]
    pub group: String,

    /// Wall-clock bound on the target, in seconds. 0 disables the deadline.
    #[serde(default)]
    pub time_limit: u64,

    /// Size of the `/tmp` tmpfs, e.g. `"64m"`.
    #[serde(default = "default_tmp_size")]
    pub tmp_size: String,

    /// Use pivot_root inside the mount namespace instead of chroot.
    #[serde(default)]
    pub pivot: bool,
}

fn default_tmp_size() -> String {
    DEFAULT_TMP_SIZE.to_string()
}

/// cgroup-v2 limits. A zero or empty value means "do not set".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CgroupLimits {
    /// `memory.max`: byte count with optional k/m/g suffix, or `"max"`.
    #[serde(default)]
    pub max_memory: String,

    /// `pids.max`.
    #[serde(default)]
    pub max_pids: u64,

    /// `cgroup.max.depth`.
    #[serde(default)]
    pub max_depth: u64,

    /// `cgroup.max.descendants`.
    #[serde(default)]
    pub max_descendants: u64,

    #[serde(default)]
    pub cpu: CpuLimits,
}

/// `cpu.max` and `cpu.weight`. No-op at default values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuLimits {
    /// Quota in microseconds per period (`cpu.max`, first field).
    #[serde(default)]
    pub time: u64,

    /// Period in microseconds (`cpu.max`, second field).
    #[serde(default)]
    pub period: u64,

    /// Relative share (`cpu.weight`).
    #[serde(default)]
    pub weight: u64,
}

/// One additional bind mount into the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub data: String,
}

/// Toggles for the well-known Landlock read sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandlockSets {
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub tmp: bool,
    #[serde(default)]
    pub dns: bool,
    #[serde(default)]
    pub vm_info: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub certs: bool,
}

impl Config {
    /// Decode a configuration document from raw bytes (YAML or JSON).
    pub fn from_slice(buf: &[u8]) -> RuncageResult<Self> {
        let config: Config = serde_yaml::from_slice(buf)
            .map_err(|e| RuncageError::Config(format!("malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Re-encode as YAML. The decode/encode pair round-trips field by field.
    pub fn to_yaml(&self) -> RuncageResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| RuncageError::Config(format!("encode failed: {}", e)))
    }

    fn validate(&self) -> RuncageResult<()> {
        validate_size(&self.cgroup.max_memory)
            .map_err(|e| RuncageError::Config(format!("cgroup.max_memory: {}", e)))?;
        validate_size(&self.tmp_size)
            .map_err(|e| RuncageError::Config(format!("tmp_size: {}", e)))?;

        // A non-allow default with no allowed syscalls would filter execve
        // itself; the jailer could never start the target.
        if self.seccomp.default_action != Action::Allow && self.seccomp.syscalls.is_empty() {
            return Err(RuncageError::Config(
                "seccomp policy has no syscall rules but a restrictive default action".into(),
            ));
        }

        if self.time_limit == 0 {
            tracing::warn!("time_limit is 0: the target runs without a wall-clock bound");
        }

        Ok(())
    }
}

/// Validate a size string: empty (unset), `max`, or digits with an optional
/// k/m/g suffix. Values are written through verbatim; the kernel's memparse
/// accepts the suffixed forms.
pub fn validate_size(s: &str) -> Result<(), String> {
    if s.is_empty() || s == "max" {
        return Ok(());
    }

    let body = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') | Some(b'm') | Some(b'M') | Some(b'g') | Some(b'G') => {
            &s[..s.len() - 1]
        }
        _ => s,
    };

    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid size {:?}", s));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::namespaces::Namespace;

    #[test]
    fn test_decode_yaml() {
        let doc = r#"
envs:
  PATH: /usr/bin:/bin
namespaces: [USER, MNT, PID]
rlimits:
  - resource: NOFILE
    soft: 64
    hard: 64
cgroup:
  max_memory: 32m
  max_pids: 16
  cpu:
    weight: 100
user: nobody
group: nogroup
time_limit: 5
"#;
        let config = Config::from_slice(doc.as_bytes()).unwrap();
        assert_eq!(config.envs["PATH"], "/usr/bin:/bin");
        assert_eq!(
            config.namespaces,
            vec![Namespace::User, Namespace::Mnt, Namespace::Pid]
        );
        assert_eq!(config.cgroup.max_memory, "32m");
        assert_eq!(config.cgroup.max_pids, 16);
        assert_eq!(config.cgroup.cpu.weight, 100);
        assert_eq!(config.time_limit, 5);
        assert_eq!(config.tmp_size, "64m");
        assert!(!config.pivot);
    }

    #[test]
    fn test_decode_json_subset() {
        let doc = r#"{"namespaces":["UTS"],"time_limit":1,"user":"nobody","group":"nogroup"}"#;
        let config = Config::from_slice(doc.as_bytes()).unwrap();
        assert_eq!(config.namespaces, vec![Namespace::Uts]);
        assert_eq!(config.time_limit, 1);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let doc = "time_limit: 2\nfuture_knob: true\n";
        let config = Config::from_slice(doc.as_bytes()).unwrap();
        assert_eq!(config.time_limit, 2);
    }

    #[test]
    fn test_unknown_namespace_fatal() {
        let doc = "namespaces: [WIFI]\n";
        assert!(Config::from_slice(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_rlimit_resource_fatal() {
        let doc = "rlimits:\n  - resource: MSGQUEUE\n    soft: 1\n    hard: 1\n";
        assert!(Config::from_slice(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_restrictive_seccomp_without_rules_rejected() {
        let doc = "seccomp:\n  default_action: kill_process\n";
        let err = Config::from_slice(doc.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("seccomp"));
    }

    #[test]
    fn test_bad_memory_size_rejected() {
        let doc = "cgroup:\n  max_memory: lots\n";
        assert!(Config::from_slice(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_validate_size() {
        assert!(validate_size("").is_ok());
        assert!(validate_size("max").is_ok());
        assert!(validate_size("1048576").is_ok());
        assert!(validate_size("32m").is_ok());
        assert!(validate_size("4G").is_ok());
        assert!(validate_size("m").is_err());
        assert!(validate_size("12q").is_err());
        assert!(validate_size("-1").is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let doc = r#"
envs: {A: x}
namespaces: [USER, MNT]
cgroup: {max_memory: 32m, max_pids: 8}
binds:
  - source: /opt/toolchain
    target: /opt/toolchain
files: ["r:/usr"]
landlock: {tmp: true}
user: nobody
group: nogroup
time_limit: 5
"#;
        let config = Config::from_slice(doc.as_bytes()).unwrap();
        let encoded = config.to_yaml().unwrap();
        let back = Config::from_slice(encoded.as_bytes()).unwrap();
        assert_eq!(back, config);
    }
}
