//! Symbolic namespace names and clone-flag assembly.

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// A namespace the jailer can be cloned into. Decoded from the uppercase
/// symbolic names in the configuration; unknown names fail the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Namespace {
    Cgroup,
    Uts,
    Ipc,
    Mnt,
    User,
    Pid,
    Net,
    Time,
}

impl Namespace {
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Namespace::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            Namespace::Uts => CloneFlags::CLONE_NEWUTS,
            Namespace::Ipc => CloneFlags::CLONE_NEWIPC,
            Namespace::Mnt => CloneFlags::CLONE_NEWNS,
            Namespace::User => CloneFlags::CLONE_NEWUSER,
            Namespace::Pid => CloneFlags::CLONE_NEWPID,
            Namespace::Net => CloneFlags::CLONE_NEWNET,
            // nix has no named constant for the time namespace yet.
            Namespace::Time => CloneFlags::from_bits_retain(libc::CLONE_NEWTIME),
        }
    }
}

/// OR the clone flags for the requested namespaces into one bitmask.
///
/// Pure function of the input set; input order and duplicates are
/// irrelevant.
pub fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    namespaces
        .iter()
        .fold(CloneFlags::empty(), |mask, ns| mask | ns.clone_flag())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_is_or_of_constants() {
        let mask = clone_flags(&[Namespace::User, Namespace::Mnt, Namespace::Pid]);
        assert_eq!(
            mask,
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID
        );
    }

    #[test]
    fn test_mask_is_order_independent() {
        let a = clone_flags(&[Namespace::Net, Namespace::Uts, Namespace::Ipc]);
        let b = clone_flags(&[Namespace::Ipc, Namespace::Net, Namespace::Uts]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicates_collapse() {
        let a = clone_flags(&[Namespace::Pid, Namespace::Pid]);
        let b = clone_flags(&[Namespace::Pid]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_set_is_empty_mask() {
        assert_eq!(clone_flags(&[]), CloneFlags::empty());
    }

    #[test]
    fn test_time_namespace_bit() {
        let mask = clone_flags(&[Namespace::Time]);
        assert_eq!(mask.bits(), libc::CLONE_NEWTIME);
    }

    #[test]
    fn test_symbolic_names_decode() {
        let names: Vec<Namespace> =
            serde_yaml::from_str("[CGROUP, UTS, IPC, MNT, USER, PID, NET, TIME]").unwrap();
        assert_eq!(names.len(), 8);
        assert!(serde_yaml::from_str::<Vec<Namespace>>("[JAIL]").is_err());
    }
}
