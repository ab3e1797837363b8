use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Identifies the class of machine an end state or trace was recorded on.
/// End states are only comparable between identical platforms; the runner
/// refuses to play end states stamped for a different one.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub enum PlatformId {
    Undefined,
    X86_64Generic,
    AArch64Generic,
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlatformId::Undefined => "undefined",
            PlatformId::X86_64Generic => "x86_64-generic",
            PlatformId::AArch64Generic => "aarch64-generic",
        };
        f.write_str(name)
    }
}

/// The platform of the current process. Process-wide, read-mostly; safe for
/// concurrent readers.
pub fn current_platform_id() -> PlatformId {
    if cfg!(target_arch = "aarch64") {
        PlatformId::AArch64Generic
    } else if cfg!(target_arch = "x86_64") {
        PlatformId::X86_64Generic
    } else {
        PlatformId::Undefined
    }
}
