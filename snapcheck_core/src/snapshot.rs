use crate::arch::{Arch, PAGE_SIZE};
use crate::byte_set::MemoryByteSet;
use crate::memory::{
    reserved_memory_mappings, MemoryBytes, MemoryError, MemoryMapping, MemoryPerms,
};
use crate::platform::PlatformId;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// A 64-bit byte address inside a snapshot's address space.
pub type Address = u64;

/// Errors raised by snapshot validation and persistence.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The snapshot or a proposed mutation violates a structural invariant.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// An I/O error while reading or writing a snapshot file.
    #[error("snapshot I/O error: {0}")]
    Io(String),

    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    #[error("snapshot deserialization error: {0}")]
    Deserialization(String),
}

/// Signal numbers a snapshot execution can stop on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub enum SigNum {
    SigSegv,
    SigTrap,
    SigFpe,
    SigIll,
    SigBus,
}

impl std::fmt::Display for SigNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SigNum::SigSegv => "SIGSEGV",
            SigNum::SigTrap => "SIGTRAP",
            SigNum::SigFpe => "SIGFPE",
            SigNum::SigIll => "SIGILL",
            SigNum::SigBus => "SIGBUS",
        };
        f.write_str(name)
    }
}

/// Finer-grained cause of a SIGSEGV (or generic for other signals).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub enum SigCause {
    GenericSigCause,
    SegvCantRead,
    SegvCantWrite,
    SegvCantExec,
    SegvOverflow,
    SegvGeneralProtection,
}

impl std::fmt::Display for SigCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SigCause::GenericSigCause => "generic",
            SigCause::SegvCantRead => "cant-read",
            SigCause::SegvCantWrite => "cant-write",
            SigCause::SegvCantExec => "cant-exec",
            SigCause::SegvOverflow => "overflow",
            SigCause::SegvGeneralProtection => "general-protection",
        };
        f.write_str(name)
    }
}

/// Where a snapshot's execution is expected to stop: at a specific
/// instruction address, or on delivery of a specific signal.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub enum Endpoint {
    Instruction {
        address: Address,
    },
    Signal {
        sig_num: SigNum,
        sig_cause: SigCause,
        /// Address the faulting access touched (0 when meaningless).
        sig_address: Address,
        /// Address of the instruction that raised the signal.
        sig_instruction_address: Address,
    },
}

impl Endpoint {
    pub fn instruction(address: Address) -> Self {
        Endpoint::Instruction { address }
    }

    pub fn signal(
        sig_num: SigNum,
        sig_cause: SigCause,
        sig_address: Address,
        sig_instruction_address: Address,
    ) -> Self {
        Endpoint::Signal {
            sig_num,
            sig_cause,
            sig_address,
            sig_instruction_address,
        }
    }

    pub fn is_instruction(&self) -> bool {
        matches!(self, Endpoint::Instruction { .. })
    }

    /// The address of the instruction the execution stopped at, for either
    /// endpoint kind.
    pub fn stop_instruction_address(&self) -> Address {
        match self {
            Endpoint::Instruction { address } => *address,
            Endpoint::Signal {
                sig_instruction_address,
                ..
            } => *sig_instruction_address,
        }
    }
}

/// Per-architecture register snapshot. The instruction and stack pointers are
/// explicit; everything else is an opaque, architecture-defined byte blob.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct RegisterState {
    arch: Arch,
    instruction_pointer: u64,
    stack_pointer: u64,
    gregs: Vec<u8>,
}

impl RegisterState {
    pub fn new(arch: Arch, instruction_pointer: u64, stack_pointer: u64) -> Self {
        Self {
            arch,
            instruction_pointer,
            stack_pointer,
            gregs: Vec::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// RIP on x86_64, PC on AArch64.
    pub fn instruction_pointer(&self) -> u64 {
        self.instruction_pointer
    }

    /// RSP on x86_64, SP on AArch64.
    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    pub fn gregs(&self) -> &[u8] {
        &self.gregs
    }

    pub fn set_gregs(&mut self, gregs: Vec<u8>) {
        self.gregs = gregs;
    }
}

/// The full observable state at an endpoint.
///
/// A *complete* end state carries a concrete endpoint plus the register state
/// observed there. The *undefined* form carries only an endpoint; the maker
/// installs it as a placeholder until `record_end_state` captures the real
/// thing.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct EndState {
    endpoint: Endpoint,
    memory_bytes: Vec<MemoryBytes>,
    registers: Option<RegisterState>,
    platforms: Vec<PlatformId>,
}

impl EndState {
    /// An undefined end state anchored at `instruction_address`.
    pub fn undefined(instruction_address: Address) -> Self {
        Self::undefined_at(Endpoint::instruction(instruction_address))
    }

    /// An undefined end state anchored at an arbitrary endpoint.
    pub fn undefined_at(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            memory_bytes: Vec::new(),
            registers: None,
            platforms: Vec::new(),
        }
    }

    pub fn new(endpoint: Endpoint, registers: RegisterState) -> Self {
        Self {
            endpoint,
            memory_bytes: Vec::new(),
            registers: Some(registers),
            platforms: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn memory_bytes(&self) -> &[MemoryBytes] {
        &self.memory_bytes
    }

    pub fn add_memory_bytes(&mut self, bytes: MemoryBytes) {
        self.memory_bytes.push(bytes);
    }

    pub fn registers(&self) -> Option<&RegisterState> {
        self.registers.as_ref()
    }

    pub fn platforms(&self) -> &[PlatformId] {
        &self.platforms
    }

    pub fn set_platforms(&mut self, platforms: Vec<PlatformId>) {
        self.platforms = platforms;
    }

    pub fn add_platform(&mut self, platform: PlatformId) {
        if !self.platforms.contains(&platform) {
            self.platforms.push(platform);
        }
    }

    /// True iff this end state carries a register state (i.e. is not the
    /// undefined placeholder).
    pub fn is_complete(&self) -> bool {
        self.registers.is_some()
    }
}

/// Disassembly captured while single-stepping a snapshot.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct TraceData {
    num_instructions: u64,
    disassembly: String,
    platforms: Vec<PlatformId>,
}

impl TraceData {
    pub fn new(num_instructions: u64, disassembly: String) -> Self {
        Self {
            num_instructions,
            disassembly,
            platforms: Vec::new(),
        }
    }

    pub fn num_instructions(&self) -> u64 {
        self.num_instructions
    }

    pub fn disassembly(&self) -> &str {
        &self.disassembly
    }

    pub fn platforms(&self) -> &[PlatformId] {
        &self.platforms
    }

    pub fn add_platform(&mut self, platform: PlatformId) {
        if !self.platforms.contains(&platform) {
            self.platforms.push(platform);
        }
    }
}

/// Which end-state shape `Snapshot::is_complete` accepts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Completeness {
    /// Every expected end state must be complete.
    Complete,
    /// Undefined (endpoint-only) end states are acceptable. Used while a
    /// snapshot is still being made.
    UndefinedEndState,
}

/// A reproducible description of a short CPU execution: initial memory,
/// initial registers, and the expected post-execution states.
///
/// Mutations go through `can_add_*` / `add_*` pairs; the `add_*` methods
/// re-validate, so a snapshot that was built exclusively through them
/// satisfies the structural invariants: pairwise-disjoint page-aligned
/// mappings, byte regions contained in mappings, and no overlap with the
/// runner's reserved regions.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct Snapshot {
    id: String,
    arch: Arch,
    memory_mappings: Vec<MemoryMapping>,
    negative_memory_mappings: Vec<MemoryMapping>,
    memory_bytes: Vec<MemoryBytes>,
    registers: Option<RegisterState>,
    expected_end_states: Vec<EndState>,
    trace_data: Vec<TraceData>,
}

impl Snapshot {
    pub fn new(arch: Arch, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            arch,
            memory_mappings: Vec::new(),
            negative_memory_mappings: Vec::new(),
            memory_bytes: Vec::new(),
            registers: None,
            expected_end_states: Vec::new(),
            trace_data: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn memory_mappings(&self) -> &[MemoryMapping] {
        &self.memory_mappings
    }

    pub fn negative_memory_mappings(&self) -> &[MemoryMapping] {
        &self.negative_memory_mappings
    }

    pub fn memory_bytes(&self) -> &[MemoryBytes] {
        &self.memory_bytes
    }

    pub fn registers(&self) -> Option<&RegisterState> {
        self.registers.as_ref()
    }

    pub fn set_registers(&mut self, registers: RegisterState) {
        self.registers = Some(registers);
    }

    pub fn expected_end_states(&self) -> &[EndState] {
        &self.expected_end_states
    }

    pub fn set_expected_end_states(&mut self, end_states: Vec<EndState>) {
        self.expected_end_states = end_states;
    }

    pub fn trace_data(&self) -> &[TraceData] {
        &self.trace_data
    }

    pub fn set_trace_data(&mut self, trace_data: Vec<TraceData>) {
        self.trace_data = trace_data;
    }

    /// Total number of mapped pages.
    pub fn num_pages(&self) -> u64 {
        self.memory_mappings
            .iter()
            .map(MemoryMapping::num_pages)
            .sum()
    }

    /// The union of all memory mappings as an interval set.
    pub fn mapped_memory(&self) -> MemoryByteSet {
        let mut set = MemoryByteSet::new();
        for m in &self.memory_mappings {
            set.add(m.start_address(), m.limit_address());
        }
        set
    }

    /// Validates that `mapping` may be added: disjoint from existing
    /// mappings, negative mappings, and the runner's reserved regions.
    pub fn can_add_memory_mapping(&self, mapping: &MemoryMapping) -> Result<(), SnapshotError> {
        for existing in &self.memory_mappings {
            if existing.overlaps(mapping) {
                return Err(SnapshotError::InvalidArgument(format!(
                    "mapping {mapping} overlaps existing mapping {existing}"
                )));
            }
        }
        for negative in &self.negative_memory_mappings {
            if negative.overlaps(mapping) {
                return Err(SnapshotError::InvalidArgument(format!(
                    "mapping {mapping} overlaps negative mapping {negative}"
                )));
            }
        }
        if reserved_memory_mappings().overlaps(mapping.start_address(), mapping.limit_address()) {
            return Err(SnapshotError::InvalidArgument(format!(
                "mapping {mapping} overlaps reserved memory mappings"
            )));
        }
        Ok(())
    }

    pub fn add_memory_mapping(&mut self, mapping: MemoryMapping) -> Result<(), SnapshotError> {
        self.can_add_memory_mapping(&mapping)?;
        self.memory_mappings.push(mapping);
        Ok(())
    }

    /// Validates that `bytes` may be added: the region must lie inside the
    /// mapped memory and must not overlap an existing byte region.
    pub fn can_add_memory_bytes(&self, bytes: &MemoryBytes) -> Result<(), SnapshotError> {
        if !self
            .mapped_memory()
            .contains(bytes.start_address(), bytes.limit_address())
        {
            return Err(SnapshotError::InvalidArgument(format!(
                "memory bytes [{:#x}, {:#x}) are not contained in any memory mapping",
                bytes.start_address(),
                bytes.limit_address()
            )));
        }
        for existing in &self.memory_bytes {
            if existing.start_address() < bytes.limit_address()
                && bytes.start_address() < existing.limit_address()
            {
                return Err(SnapshotError::InvalidArgument(format!(
                    "memory bytes [{:#x}, {:#x}) overlap existing bytes at [{:#x}, {:#x})",
                    bytes.start_address(),
                    bytes.limit_address(),
                    existing.start_address(),
                    existing.limit_address()
                )));
            }
        }
        Ok(())
    }

    pub fn add_memory_bytes(&mut self, bytes: MemoryBytes) -> Result<(), SnapshotError> {
        self.can_add_memory_bytes(&bytes)?;
        self.memory_bytes.push(bytes);
        Ok(())
    }

    /// Validates that `end_state` may be added as an expected end state.
    ///
    /// Instruction endpoints must fall inside an executable mapping, the end
    /// state's byte regions must be contained in mapped memory, and a
    /// complete end state's registers must match the snapshot architecture.
    pub fn can_add_expected_end_state(&self, end_state: &EndState) -> Result<(), SnapshotError> {
        if let Endpoint::Instruction { address } = end_state.endpoint() {
            let in_executable = self.memory_mappings.iter().any(|m| {
                m.perms().has(MemoryPerms::x())
                    && m.start_address() <= *address
                    && *address < m.limit_address()
            });
            if !in_executable {
                return Err(SnapshotError::InvalidArgument(format!(
                    "end state endpoint {address:#x} is not inside an executable mapping"
                )));
            }
        }
        let mapped = self.mapped_memory();
        for bytes in end_state.memory_bytes() {
            if !mapped.contains(bytes.start_address(), bytes.limit_address()) {
                return Err(SnapshotError::InvalidArgument(format!(
                    "end state memory bytes [{:#x}, {:#x}) are not contained in any memory mapping",
                    bytes.start_address(),
                    bytes.limit_address()
                )));
            }
        }
        if let Some(registers) = end_state.registers() {
            if registers.arch() != self.arch {
                return Err(SnapshotError::InvalidArgument(format!(
                    "end state registers are for {} but snapshot is {}",
                    registers.arch(),
                    self.arch
                )));
            }
        }
        Ok(())
    }

    pub fn add_expected_end_state(&mut self, end_state: EndState) -> Result<(), SnapshotError> {
        self.can_add_expected_end_state(&end_state)?;
        self.expected_end_states.push(end_state);
        Ok(())
    }

    pub fn set_negative_memory_mappings(&mut self, mappings: Vec<MemoryMapping>) {
        self.negative_memory_mappings = mappings;
    }

    /// Validates that `mapping` may be asserted as unmapped: it must be
    /// disjoint from the positive mappings.
    pub fn can_add_negative_memory_mapping(
        &self,
        mapping: &MemoryMapping,
    ) -> Result<(), SnapshotError> {
        for existing in &self.memory_mappings {
            if existing.overlaps(mapping) {
                return Err(SnapshotError::InvalidArgument(format!(
                    "negative mapping {mapping} overlaps memory mapping {existing}"
                )));
            }
        }
        Ok(())
    }

    pub fn add_negative_memory_mapping(
        &mut self,
        mapping: MemoryMapping,
    ) -> Result<(), SnapshotError> {
        self.can_add_negative_memory_mapping(&mapping)?;
        self.negative_memory_mappings.push(mapping);
        Ok(())
    }

    /// Derives negative memory mappings from `end_state`: if its endpoint is
    /// a signal whose faulting address lies outside mapped memory, the page
    /// containing that address is asserted unmapped. Mappings are page
    /// granular, so a page is either fully mapped or fully unmapped.
    pub fn add_negative_memory_mappings_for(
        &mut self,
        end_state: &EndState,
    ) -> Result<(), SnapshotError> {
        let Endpoint::Signal { sig_address, .. } = end_state.endpoint() else {
            return Ok(());
        };
        let page_start = sig_address & !(PAGE_SIZE - 1);
        let page_limit = page_start + PAGE_SIZE;
        if self.mapped_memory().contains(page_start, page_limit) {
            return Ok(());
        }
        let already_negative = self
            .negative_memory_mappings
            .iter()
            .any(|m| m.start_address() <= page_start && page_limit <= m.limit_address());
        if already_negative {
            return Ok(());
        }
        let mapping = MemoryMapping::make_ranged(page_start, page_limit, MemoryPerms::none())?;
        self.add_negative_memory_mapping(mapping)
    }

    /// Checks that the snapshot is a fully-specified execution: registers
    /// and at least one mapping and end state are present, every byte region
    /// lies in mapped memory, and (in `Complete` mode) every expected end
    /// state carries registers.
    pub fn is_complete(&self, mode: Completeness) -> Result<(), SnapshotError> {
        if self.registers.is_none() {
            return Err(SnapshotError::InvalidArgument(format!(
                "snapshot {} has no register state",
                self.id
            )));
        }
        if self.memory_mappings.is_empty() {
            return Err(SnapshotError::InvalidArgument(format!(
                "snapshot {} has no memory mappings",
                self.id
            )));
        }
        if self.expected_end_states.is_empty() {
            return Err(SnapshotError::InvalidArgument(format!(
                "snapshot {} has no expected end states",
                self.id
            )));
        }
        let mapped = self.mapped_memory();
        for bytes in &self.memory_bytes {
            if !mapped.contains(bytes.start_address(), bytes.limit_address()) {
                return Err(SnapshotError::InvalidArgument(format!(
                    "memory bytes [{:#x}, {:#x}) escape the memory mappings",
                    bytes.start_address(),
                    bytes.limit_address()
                )));
            }
        }
        if mode == Completeness::Complete {
            for (i, end_state) in self.expected_end_states.iter().enumerate() {
                if !end_state.is_complete() {
                    return Err(SnapshotError::InvalidArgument(format!(
                        "expected end state #{i} of snapshot {} is undefined",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn file_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Writes the snapshot to `path` in its binary file encoding.
    pub fn write_to_file(&self, path: &Path) -> Result<(), SnapshotError> {
        let encoded = bincode::encode_to_vec(self, Self::file_config())
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        std::fs::write(path, encoded)
            .map_err(|e| SnapshotError::Io(format!("failed to write {path:?}: {e}")))
    }

    /// Reads a snapshot previously written with [`Snapshot::write_to_file`].
    pub fn read_from_file(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read(path)
            .map_err(|e| SnapshotError::Io(format!("failed to read {path:?}: {e}")))?;
        let (snapshot, _len): (Snapshot, usize) =
            bincode::decode_from_slice(&content, Self::file_config())
                .map_err(|e| SnapshotError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}
