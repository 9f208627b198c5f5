//! Landlock filesystem rules.
//!
//! Path rules come in as `"<flags>:<path>"` strings, flags a subset of
//! `rwxc` (read, write, execute, create). On top of the explicit rules the
//! configuration can switch on well-known sets — the handful of paths a
//! dynamically linked program or a TLS client needs without the operator
//! spelling them out every time.
//!
//! Enforcement is mandatory: anything short of a fully enforced ruleset is
//! an error, because a partially enforced cage reads as secure while it is
//! not. An empty ruleset skips Landlock entirely.

use std::path::Path;

use landlock::{
    ABI, Access, AccessFs, BitFlags, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
    RulesetStatus,
};

use crate::config::LandlockSets;
use runcage_shared::{RuncageError, RuncageResult};

/// Newest ABI whose access rights this module hands out.
const LANDLOCK_ABI: ABI = ABI::V2;

/// One parsed path rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub path: String,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub create: bool,
}

impl PathRule {
    /// Parse a `"<flags>:<path>"` spec.
    pub fn parse(spec: &str) -> RuncageResult<Self> {
        let (flags, path) = spec
            .split_once(':')
            .ok_or_else(|| RuncageError::Landlock(format!("malformed file rule {:?}", spec)))?;

        if path.is_empty() {
            return Err(RuncageError::Landlock(format!(
                "file rule {:?} has no path",
                spec
            )));
        }

        let mut rule = PathRule {
            path: path.to_string(),
            read: false,
            write: false,
            execute: false,
            create: false,
        };

        for flag in flags.chars() {
            match flag {
                'r' => rule.read = true,
                'w' => rule.write = true,
                'x' => rule.execute = true,
                'c' => rule.create = true,
                other => {
                    return Err(RuncageError::Landlock(format!(
                        "unknown access flag {:?} in {:?}",
                        other, spec
                    )));
                }
            }
        }

        if !(rule.read || rule.write || rule.execute || rule.create) {
            return Err(RuncageError::Landlock(format!(
                "file rule {:?} grants nothing",
                spec
            )));
        }

        Ok(rule)
    }

    fn access(&self) -> BitFlags<AccessFs> {
        let mut access = BitFlags::<AccessFs>::empty();
        if self.read {
            access |= AccessFs::ReadFile | AccessFs::ReadDir;
        }
        if self.write {
            access |= AccessFs::WriteFile;
        }
        if self.execute {
            access |= AccessFs::Execute;
        }
        if self.create {
            access |= AccessFs::MakeReg
                | AccessFs::MakeDir
                | AccessFs::MakeSym
                | AccessFs::MakeSock
                | AccessFs::MakeFifo
                | AccessFs::MakeBlock
                | AccessFs::MakeChar
                | AccessFs::RemoveFile
                | AccessFs::RemoveDir;
        }
        access
    }
}

/// Expand the switched-on well-known sets into path rules. Paths that do
/// not exist inside the root are skipped — the sets describe common
/// layouts, not guarantees.
fn well_known_rules(sets: &LandlockSets) -> Vec<PathRule> {
    let mut rules = Vec::new();
    let mut add = |enabled: bool, flags: &str, paths: &[&str]| {
        if !enabled {
            return;
        }
        for path in paths {
            if !Path::new(path).exists() {
                tracing::debug!(path = *path, "well-known landlock path absent, skipping");
                continue;
            }
            // The flag strings here are the module's own, always valid.
            rules.push(PathRule::parse(&format!("{}:{}", flags, path)).expect("static rule"));
        }
    };

    add(sets.tty, "rw", &["/dev/tty", "/dev/ptmx", "/dev/pts"]);
    add(sets.tmp, "rwc", &["/tmp"]);
    add(
        sets.dns,
        "r",
        &[
            "/etc/resolv.conf",
            "/etc/hosts",
            "/etc/nsswitch.conf",
            "/etc/host.conf",
            "/etc/services",
        ],
    );
    add(
        sets.vm_info,
        "r",
        &[
            "/proc/meminfo",
            "/proc/cpuinfo",
            "/proc/stat",
            "/sys/devices/system/cpu",
        ],
    );
    add(
        sets.shared,
        "rx",
        &[
            "/lib",
            "/lib64",
            "/usr/lib",
            "/usr/lib64",
            "/etc/ld.so.cache",
        ],
    );
    add(
        sets.certs,
        "r",
        &[
            "/etc/ssl/certs",
            "/etc/ca-certificates",
            "/usr/share/ca-certificates",
        ],
    );

    rules
}

/// Install the ruleset and restrict this process. Empty ruleset → no-op.
pub fn enforce(files: &[String], sets: &LandlockSets) -> RuncageResult<()> {
    let mut rules: Vec<PathRule> = files
        .iter()
        .map(|spec| PathRule::parse(spec))
        .collect::<RuncageResult<_>>()?;
    rules.extend(well_known_rules(sets));

    if rules.is_empty() {
        tracing::debug!("no landlock rules configured, skipping");
        return Ok(());
    }

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(LANDLOCK_ABI))
        .map_err(|e| RuncageError::Landlock(format!("ruleset creation failed: {}", e)))?
        .create()
        .map_err(|e| RuncageError::Landlock(format!("ruleset creation failed: {}", e)))?;

    for rule in &rules {
        let fd = PathFd::new(&rule.path)
            .map_err(|e| RuncageError::Landlock(format!("open {}: {}", rule.path, e)))?;
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, rule.access()))
            .map_err(|e| RuncageError::Landlock(format!("rule for {}: {}", rule.path, e)))?;
    }

    let status = ruleset
        .restrict_self()
        .map_err(|e| RuncageError::Landlock(format!("restrict_self failed: {}", e)))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {
            tracing::debug!(rules = rules.len(), "landlock enforced");
            Ok(())
        }
        RulesetStatus::PartiallyEnforced => Err(RuncageError::Landlock(
            "ruleset only partially enforced by this kernel".into(),
        )),
        RulesetStatus::NotEnforced => {
            Err(RuncageError::Landlock("landlock is not supported".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_flags() {
        let rule = PathRule::parse("rwxc:/srv/data").unwrap();
        assert!(rule.read && rule.write && rule.execute && rule.create);
        assert_eq!(rule.path, "/srv/data");
    }

    #[test]
    fn test_parse_read_only() {
        let rule = PathRule::parse("r:/usr").unwrap();
        assert!(rule.read);
        assert!(!rule.write && !rule.execute && !rule.create);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PathRule::parse("/usr").is_err());
        assert!(PathRule::parse("q:/usr").is_err());
        assert!(PathRule::parse("r:").is_err());
        assert!(PathRule::parse(":/usr").is_err());
    }

    #[test]
    fn test_access_bits() {
        let rule = PathRule::parse("r:/usr").unwrap();
        let access = rule.access();
        assert!(access.contains(AccessFs::ReadFile));
        assert!(access.contains(AccessFs::ReadDir));
        assert!(!access.contains(AccessFs::WriteFile));
        assert!(!access.contains(AccessFs::Execute));

        let rule = PathRule::parse("c:/tmp").unwrap();
        let access = rule.access();
        assert!(access.contains(AccessFs::MakeReg));
        assert!(access.contains(AccessFs::RemoveFile));
        assert!(!access.contains(AccessFs::ReadFile));
    }

    #[test]
    fn test_well_known_sets_expand_to_existing_paths() {
        let sets = LandlockSets {
            tmp: true,
            ..LandlockSets::default()
        };
        let rules = well_known_rules(&sets);
        // /tmp exists everywhere we run tests
        assert!(rules.iter().any(|r| r.path == "/tmp" && r.create));

        let none = well_known_rules(&LandlockSets::default());
        assert!(none.is_empty());
    }
}
