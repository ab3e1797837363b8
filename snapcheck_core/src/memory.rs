use crate::arch::{is_page_aligned, PAGE_SIZE};
use crate::byte_set::MemoryByteSet;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors raised while constructing memory mappings and byte regions.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A mapping boundary is not a multiple of the page size.
    #[error("range [{0:#x}, {1:#x}) is not page-aligned")]
    NotPageAligned(u64, u64),

    /// The range is empty or its limit precedes its start.
    #[error("range [{0:#x}, {1:#x}) is empty or inverted")]
    EmptyRange(u64, u64),

    /// The range wraps past the end of the address space.
    #[error("range starting at {0:#x} with {1} bytes overflows the address space")]
    AddressOverflow(u64, u64),
}

/// A set over {R, W, X} page permissions.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct MemoryPerms {
    bits: u8,
}

impl MemoryPerms {
    const R_BIT: u8 = 1;
    const W_BIT: u8 = 2;
    const X_BIT: u8 = 4;

    pub const fn none() -> Self {
        Self { bits: 0 }
    }
    pub const fn r() -> Self {
        Self { bits: Self::R_BIT }
    }
    pub const fn w() -> Self {
        Self { bits: Self::W_BIT }
    }
    pub const fn x() -> Self {
        Self { bits: Self::X_BIT }
    }
    pub const fn rw() -> Self {
        Self {
            bits: Self::R_BIT | Self::W_BIT,
        }
    }
    pub const fn rx() -> Self {
        Self {
            bits: Self::R_BIT | Self::X_BIT,
        }
    }
    pub const fn all() -> Self {
        Self {
            bits: Self::R_BIT | Self::W_BIT | Self::X_BIT,
        }
    }

    /// True iff every permission in `other` is also in `self`.
    pub const fn has(self, other: MemoryPerms) -> bool {
        self.bits & other.bits == other.bits
    }

    pub const fn union(self, other: MemoryPerms) -> MemoryPerms {
        MemoryPerms {
            bits: self.bits | other.bits,
        }
    }

    /// Stable single-byte encoding used by the corpus layout.
    pub const fn to_bits(self) -> u8 {
        self.bits
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self { bits: bits & 0x7 }
    }
}

impl std::fmt::Display for MemoryPerms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.has(MemoryPerms::r()) { "r" } else { "-" },
            if self.has(MemoryPerms::w()) { "w" } else { "-" },
            if self.has(MemoryPerms::x()) { "x" } else { "-" },
        )
    }
}

/// A page-aligned half-open byte interval `[start, limit)` with permissions.
///
/// Construction goes through [`MemoryMapping::make_ranged`], which enforces
/// alignment and non-emptiness, so every live value satisfies the invariant.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct MemoryMapping {
    start_address: u64,
    num_bytes: u64,
    perms: MemoryPerms,
}

impl MemoryMapping {
    /// Checks whether `[start, limit)` can form a mapping: page-aligned on
    /// both ends and non-empty.
    pub fn can_make_ranged(start_address: u64, limit_address: u64) -> Result<(), MemoryError> {
        if start_address >= limit_address {
            return Err(MemoryError::EmptyRange(start_address, limit_address));
        }
        if !is_page_aligned(start_address) || !is_page_aligned(limit_address) {
            return Err(MemoryError::NotPageAligned(start_address, limit_address));
        }
        Ok(())
    }

    pub fn make_ranged(
        start_address: u64,
        limit_address: u64,
        perms: MemoryPerms,
    ) -> Result<Self, MemoryError> {
        Self::can_make_ranged(start_address, limit_address)?;
        Ok(Self {
            start_address,
            num_bytes: limit_address - start_address,
            perms,
        })
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub fn limit_address(&self) -> u64 {
        self.start_address + self.num_bytes
    }

    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    pub fn num_pages(&self) -> u64 {
        self.num_bytes / PAGE_SIZE
    }

    pub fn perms(&self) -> MemoryPerms {
        self.perms
    }

    pub fn set_perms(&mut self, perms: MemoryPerms) {
        self.perms = perms;
    }

    pub fn overlaps(&self, other: &MemoryMapping) -> bool {
        self.start_address() < other.limit_address() && other.start_address() < self.limit_address()
    }
}

impl std::fmt::Display for MemoryMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) {}",
            self.start_address(),
            self.limit_address(),
            self.perms
        )
    }
}

/// A byte-exact contents assertion for `[start, start + len)`.
///
/// Unlike mappings, byte regions need not be page-aligned; they only have to
/// lie inside some mapping of the owning snapshot.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct MemoryBytes {
    start_address: u64,
    byte_values: Vec<u8>,
}

impl MemoryBytes {
    pub fn new(start_address: u64, byte_values: Vec<u8>) -> Result<Self, MemoryError> {
        if byte_values.is_empty() {
            return Err(MemoryError::EmptyRange(start_address, start_address));
        }
        if start_address.checked_add(byte_values.len() as u64).is_none() {
            return Err(MemoryError::AddressOverflow(
                start_address,
                byte_values.len() as u64,
            ));
        }
        Ok(Self {
            start_address,
            byte_values,
        })
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub fn limit_address(&self) -> u64 {
        self.start_address + self.byte_values.len() as u64
    }

    pub fn num_bytes(&self) -> u64 {
        self.byte_values.len() as u64
    }

    pub fn byte_values(&self) -> &[u8] {
        &self.byte_values
    }

    /// True iff the region is a run of one repeated byte value. The corpus
    /// writer stores such regions as `(fill, count)` instead of a literal
    /// byte array.
    pub fn repeating(&self) -> bool {
        let first = self.byte_values[0];
        self.byte_values.iter().all(|&b| b == first)
    }
}

/// Address ranges the runner itself occupies: the null page guard, the
/// runner's fixed load image, and the kernel half of the address space.
/// Snapshots must never map into these. Initialized once, read-only after.
pub fn reserved_memory_mappings() -> &'static MemoryByteSet {
    static RESERVED: OnceLock<MemoryByteSet> = OnceLock::new();
    RESERVED.get_or_init(|| {
        let mut set = MemoryByteSet::new();
        set.add(0, 0x10000);
        set.add(0x5500_0000_0000, 0x5580_0000_0000);
        set.add(0xFFFF_8000_0000_0000, u64::MAX);
        set
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perms_membership_and_union() {
        let rw = MemoryPerms::rw();
        assert!(rw.has(MemoryPerms::r()));
        assert!(rw.has(MemoryPerms::w()));
        assert!(!rw.has(MemoryPerms::x()));
        assert!(rw.has(MemoryPerms::none()));
        assert_eq!(rw.union(MemoryPerms::x()), MemoryPerms::all());
        assert_eq!(format!("{}", MemoryPerms::rx()), "r-x");
    }

    #[test]
    fn perms_bits_round_trip() {
        for perms in [
            MemoryPerms::none(),
            MemoryPerms::r(),
            MemoryPerms::rw(),
            MemoryPerms::rx(),
            MemoryPerms::all(),
        ] {
            assert_eq!(MemoryPerms::from_bits(perms.to_bits()), perms);
        }
    }

    #[test]
    fn make_ranged_validates_alignment_and_order() {
        assert!(MemoryMapping::make_ranged(0x1000, 0x3000, MemoryPerms::rw()).is_ok());
        assert!(matches!(
            MemoryMapping::make_ranged(0x1001, 0x3000, MemoryPerms::rw()),
            Err(MemoryError::NotPageAligned(_, _))
        ));
        assert!(matches!(
            MemoryMapping::make_ranged(0x1000, 0x2fff, MemoryPerms::rw()),
            Err(MemoryError::NotPageAligned(_, _))
        ));
        assert!(matches!(
            MemoryMapping::make_ranged(0x3000, 0x3000, MemoryPerms::rw()),
            Err(MemoryError::EmptyRange(_, _))
        ));
        assert!(matches!(
            MemoryMapping::make_ranged(0x3000, 0x1000, MemoryPerms::rw()),
            Err(MemoryError::EmptyRange(_, _))
        ));
    }

    #[test]
    fn mapping_accessors() {
        let m = MemoryMapping::make_ranged(0x2000, 0x4000, MemoryPerms::rx()).unwrap();
        assert_eq!(m.start_address(), 0x2000);
        assert_eq!(m.limit_address(), 0x4000);
        assert_eq!(m.num_bytes(), 0x2000);
        assert_eq!(m.num_pages(), 2);
        assert!(m.perms().has(MemoryPerms::x()));
    }

    #[test]
    fn mapping_overlap() {
        let a = MemoryMapping::make_ranged(0x1000, 0x3000, MemoryPerms::rw()).unwrap();
        let b = MemoryMapping::make_ranged(0x2000, 0x4000, MemoryPerms::rw()).unwrap();
        let c = MemoryMapping::make_ranged(0x3000, 0x4000, MemoryPerms::rw()).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn memory_bytes_repeating_predicate() {
        let zeros = MemoryBytes::new(0x1000, vec![0; 64]).unwrap();
        assert!(zeros.repeating());
        let single = MemoryBytes::new(0x1000, vec![0xCC]).unwrap();
        assert!(single.repeating());
        let mixed = MemoryBytes::new(0x1000, vec![1, 2, 3]).unwrap();
        assert!(!mixed.repeating());
    }

    #[test]
    fn memory_bytes_rejects_empty_and_overflow() {
        assert!(matches!(
            MemoryBytes::new(0x1000, vec![]),
            Err(MemoryError::EmptyRange(_, _))
        ));
        assert!(matches!(
            MemoryBytes::new(u64::MAX - 1, vec![0; 4]),
            Err(MemoryError::AddressOverflow(_, _))
        ));
    }

    #[test]
    fn reserved_mappings_cover_null_page_and_kernel_half() {
        let reserved = reserved_memory_mappings();
        assert!(reserved.overlaps(0, 1));
        assert!(reserved.overlaps(0xFFFF_8000_0000_0000, 0xFFFF_8000_0000_1000));
        assert!(!reserved.overlaps(0x3000_0000, 0x3000_1000));
    }
}
