use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Page size shared by every architecture we snapshot on. Memory mappings,
/// corpus files and maker-grown regions are all multiples of this.
pub const PAGE_SIZE: u64 = 4096;

/// Architecture tag carried by every snapshot. The tag decides register
/// layout, instruction filtering and which maker stages are available.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub enum Arch {
    X86_64,
    AArch64,
}

impl Arch {
    /// The architecture this process is running on.
    pub fn current() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::AArch64
        } else {
            Arch::X86_64
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::AArch64 => "aarch64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub fn is_page_aligned(address: u64) -> bool {
    address % PAGE_SIZE == 0
}

/// Rounds `size` up to the next multiple of `PAGE_SIZE`. Saturates instead of
/// wrapping for sizes within a page of `u64::MAX`.
pub fn round_up_to_page(size: u64) -> u64 {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(bumped) => bumped & !(PAGE_SIZE - 1),
        None => u64::MAX & !(PAGE_SIZE - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment_predicate() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE));
        assert!(is_page_aligned(7 * PAGE_SIZE));
        assert!(!is_page_aligned(1));
        assert!(!is_page_aligned(PAGE_SIZE + 0x10));
    }

    #[test]
    fn round_up_behavior() {
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn current_arch_matches_target() {
        #[cfg(target_arch = "x86_64")]
        assert_eq!(Arch::current(), Arch::X86_64);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(Arch::current(), Arch::AArch64);
    }
}
