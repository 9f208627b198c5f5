//! POSIX resource limits.

use nix::sys::resource::{Resource as NixResource, setrlimit};
use serde::{Deserialize, Serialize};

use runcage_shared::{RuncageError, RuncageResult};

/// Resources the configuration may bound. Decoded from the uppercase
/// symbolic names; unknown names fail the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Resource {
    As,
    Cpu,
    Core,
    Data,
    Fsize,
    Nofile,
    Stack,
}

impl Resource {
    fn to_nix(self) -> NixResource {
        match self {
            Resource::As => NixResource::RLIMIT_AS,
            Resource::Cpu => NixResource::RLIMIT_CPU,
            Resource::Core => NixResource::RLIMIT_CORE,
            Resource::Data => NixResource::RLIMIT_DATA,
            Resource::Fsize => NixResource::RLIMIT_FSIZE,
            Resource::Nofile => NixResource::RLIMIT_NOFILE,
            Resource::Stack => NixResource::RLIMIT_STACK,
        }
    }
}

/// One `(resource, soft, hard)` limit from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    pub fn apply(&self) -> RuncageResult<()> {
        setrlimit(self.resource.to_nix(), self.soft, self.hard).map_err(|e| {
            RuncageError::Rlimit(format!("setrlimit {:?} failed: {}", self.resource, e))
        })
    }
}

/// Apply the configured limits in order.
pub fn apply_all(rlimits: &[Rlimit]) -> RuncageResult<()> {
    for limit in rlimits {
        limit.apply()?;
    }
    Ok(())
}
