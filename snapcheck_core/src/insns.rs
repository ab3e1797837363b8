use crate::arch::{Arch, PAGE_SIZE};
use crate::memory::{MemoryBytes, MemoryMapping, MemoryPerms};
use crate::snapshot::{Completeness, EndState, RegisterState, Snapshot, SnapshotError};
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use thiserror::Error;

/// Errors raised while lifting raw instruction bytes into a snapshot.
#[derive(Error, Debug)]
pub enum LiftError {
    /// The instruction bytes or the supplied context violate the fuzzing
    /// config (size, alignment, filtered instruction classes, placement).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// A `[start_address, start_address + num_bytes)` region of the snapshot
/// address space that lifted code or data may be placed in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddressRange {
    pub start_address: u64,
    pub num_bytes: u64,
}

impl AddressRange {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start_address && address < self.start_address + self.num_bytes
    }

    fn num_pages(&self) -> u64 {
        self.num_bytes / PAGE_SIZE
    }
}

/// Classes of AArch64 instructions a fuzzing campaign may exclude.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InstructionFilter {
    pub sve_instructions_allowed: bool,
    pub load_store_instructions_allowed: bool,
}

impl Default for InstructionFilter {
    fn default() -> Self {
        Self {
            sve_instructions_allowed: true,
            load_store_instructions_allowed: true,
        }
    }
}

/// Where lifted x86_64 snapshots place their code and data pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FuzzingConfigX86_64 {
    pub code_range: AddressRange,
    pub data1_range: AddressRange,
}

impl Default for FuzzingConfigX86_64 {
    fn default() -> Self {
        Self {
            code_range: AddressRange {
                start_address: 0x3000_0000,
                num_bytes: 0x4000_0000,
            },
            data1_range: AddressRange {
                start_address: 0x10_0000,
                num_bytes: 0x1000_0000,
            },
        }
    }
}

/// Where lifted AArch64 snapshots place their code and stack pages, plus the
/// instruction classes the campaign admits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FuzzingConfigAArch64 {
    pub code_range: AddressRange,
    pub stack_range: AddressRange,
    pub instruction_filter: InstructionFilter,
}

impl Default for FuzzingConfigAArch64 {
    fn default() -> Self {
        Self {
            code_range: AddressRange {
                start_address: 0x3000_0000,
                num_bytes: 0x4000_0000,
            },
            stack_range: AddressRange {
                start_address: 0x20_0000,
                num_bytes: 0x10_0000,
            },
            instruction_filter: InstructionFilter::default(),
        }
    }
}

/// The initial execution context for a lifted snapshot. Callers may edit the
/// pointers before lifting to pin the code or stack pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UContext {
    pub arch: Arch,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
}

/// The content-derived id of a snapshot lifted from `insns`: the lowercase
/// hex SHA-1 of the instruction bytes. Pure and deterministic.
pub fn instructions_to_snapshot_id(insns: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(insns);
    let digest = hasher.finalize();
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

// The code page is chosen from the hash of the instruction bytes so that
// identical inputs always land on identical pages.
fn code_page_for(insns: &[u8], code_range: &AddressRange) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(insns);
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let page_index = u64::from_le_bytes(prefix) % code_range.num_pages().max(1);
    code_range.start_address + page_index * PAGE_SIZE
}

/// Default execution context for `insns` under `config`: code page derived
/// from the instruction hash, stack pointer one page above the data range
/// start.
pub fn generate_ucontext_x86_64(insns: &[u8], config: &FuzzingConfigX86_64) -> UContext {
    UContext {
        arch: Arch::X86_64,
        instruction_pointer: code_page_for(insns, &config.code_range),
        stack_pointer: config.data1_range.start_address + PAGE_SIZE,
    }
}

/// Default execution context for `insns` under `config`: code page derived
/// from the instruction hash, stack pointer at the top of the stack range.
pub fn generate_ucontext_aarch64(insns: &[u8], config: &FuzzingConfigAArch64) -> UContext {
    UContext {
        arch: Arch::AArch64,
        instruction_pointer: code_page_for(insns, &config.code_range),
        stack_pointer: config.stack_range.start_address + config.stack_range.num_bytes,
    }
}

/// Lifts raw x86_64 instruction bytes into a two-page snapshot with an
/// undefined end state at the end of the instruction sequence.
pub fn instructions_to_snapshot_x86_64(
    insns: &[u8],
    config: &FuzzingConfigX86_64,
) -> Result<Snapshot, LiftError> {
    let ucontext = generate_ucontext_x86_64(insns, config);
    instructions_to_snapshot_x86_64_with_ucontext(insns, &ucontext, config)
}

/// Like [`instructions_to_snapshot_x86_64`] but honors the caller-supplied
/// context: the executable mapping begins at the instruction pointer and the
/// stack page ends at the stack pointer.
pub fn instructions_to_snapshot_x86_64_with_ucontext(
    insns: &[u8],
    ucontext: &UContext,
    _config: &FuzzingConfigX86_64,
) -> Result<Snapshot, LiftError> {
    if ucontext.arch != Arch::X86_64 {
        return Err(LiftError::InvalidArgument(format!(
            "ucontext is for {} but x86_64 was requested",
            ucontext.arch
        )));
    }
    validate_insn_size(insns)?;
    // int3 padding stops execution at the first byte past the sequence.
    let mut code_page = insns.to_vec();
    code_page.resize(PAGE_SIZE as usize, 0xCC);
    build_two_page_snapshot(Arch::X86_64, insns, ucontext, code_page)
}

/// Lifts raw AArch64 instruction bytes into a two-page snapshot, enforcing
/// the config's instruction filter.
pub fn instructions_to_snapshot_aarch64(
    insns: &[u8],
    config: &FuzzingConfigAArch64,
) -> Result<Snapshot, LiftError> {
    let ucontext = generate_ucontext_aarch64(insns, config);
    instructions_to_snapshot_aarch64_with_ucontext(insns, &ucontext, config)
}

/// Like [`instructions_to_snapshot_aarch64`] but honors the caller-supplied
/// context.
pub fn instructions_to_snapshot_aarch64_with_ucontext(
    insns: &[u8],
    ucontext: &UContext,
    config: &FuzzingConfigAArch64,
) -> Result<Snapshot, LiftError> {
    if ucontext.arch != Arch::AArch64 {
        return Err(LiftError::InvalidArgument(format!(
            "ucontext is for {} but aarch64 was requested",
            ucontext.arch
        )));
    }
    validate_insn_size(insns)?;
    if insns.len() % 4 != 0 {
        return Err(LiftError::InvalidArgument(format!(
            "aarch64 instruction sequence length {} is not a multiple of 4",
            insns.len()
        )));
    }
    filter_aarch64_instructions(insns, &config.instruction_filter)?;
    // brk #0 padding stops execution at the first word past the sequence.
    let mut code_page = insns.to_vec();
    while code_page.len() < PAGE_SIZE as usize {
        code_page.extend_from_slice(&[0x00, 0x00, 0x20, 0xd4]);
    }
    build_two_page_snapshot(Arch::AArch64, insns, ucontext, code_page)
}

fn validate_insn_size(insns: &[u8]) -> Result<(), LiftError> {
    if insns.is_empty() {
        return Err(LiftError::InvalidArgument(
            "instruction sequence is empty".to_string(),
        ));
    }
    // Leave room for at least one trap at the end of the code page.
    if insns.len() as u64 >= PAGE_SIZE {
        return Err(LiftError::InvalidArgument(format!(
            "instruction sequence of {} bytes does not fit a code page",
            insns.len()
        )));
    }
    Ok(())
}

fn build_two_page_snapshot(
    arch: Arch,
    insns: &[u8],
    ucontext: &UContext,
    code_page: Vec<u8>,
) -> Result<Snapshot, LiftError> {
    let code_start = ucontext.instruction_pointer;
    let stack_limit = ucontext.stack_pointer;
    let stack_start = stack_limit.checked_sub(PAGE_SIZE).ok_or_else(|| {
        LiftError::InvalidArgument(format!(
            "stack pointer {stack_limit:#x} leaves no room for a stack page"
        ))
    })?;

    let mut snapshot = Snapshot::new(arch, instructions_to_snapshot_id(insns));
    let code_mapping = MemoryMapping::make_ranged(
        code_start,
        code_start
            .checked_add(PAGE_SIZE)
            .ok_or_else(|| LiftError::InvalidArgument(format!(
                "code page at {code_start:#x} overflows the address space"
            )))?,
        MemoryPerms::rx(),
    )
    .map_err(|e| LiftError::InvalidArgument(e.to_string()))?;
    snapshot.add_memory_mapping(code_mapping)?;

    let stack_mapping = MemoryMapping::make_ranged(stack_start, stack_limit, MemoryPerms::rw())
        .map_err(|e| LiftError::InvalidArgument(e.to_string()))?;
    snapshot.add_memory_mapping(stack_mapping)?;

    snapshot.add_memory_bytes(
        MemoryBytes::new(code_start, code_page).map_err(|e| LiftError::InvalidArgument(e.to_string()))?,
    )?;
    snapshot.add_memory_bytes(
        MemoryBytes::new(stack_start, vec![0; PAGE_SIZE as usize])
            .map_err(|e| LiftError::InvalidArgument(e.to_string()))?,
    )?;

    snapshot.set_registers(RegisterState::new(
        arch,
        ucontext.instruction_pointer,
        ucontext.stack_pointer,
    ));
    snapshot.add_expected_end_state(EndState::undefined(code_start + insns.len() as u64))?;
    snapshot.is_complete(Completeness::UndefinedEndState)?;
    Ok(snapshot)
}

// AArch64 encoding groups, per the top-level op0 field (bits 28..25):
// 0b0010 is the SVE encoding space; x1x0 is the loads-and-stores space.
// SVE memory operations additionally have bits 31..29 == 0b101.
fn filter_aarch64_instructions(
    insns: &[u8],
    filter: &InstructionFilter,
) -> Result<(), LiftError> {
    for (i, word) in insns.chunks_exact(4).enumerate() {
        let insn = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        let op0 = (insn >> 25) & 0xF;
        let is_sve = op0 == 0b0010;
        let is_sve_mem = is_sve && (insn >> 29) & 0x7 == 0b101;
        let is_load_store = op0 & 0b0101 == 0b0100;
        if is_sve && !filter.sve_instructions_allowed {
            return Err(LiftError::InvalidArgument(format!(
                "instruction #{i} ({insn:#010x}) is an SVE instruction and SVE is not allowed"
            )));
        }
        if (is_load_store || is_sve_mem) && !filter.load_store_instructions_allowed {
            return Err(LiftError::InvalidArgument(format!(
                "instruction #{i} ({insn:#010x}) is a load/store instruction and loads/stores \
                 are not allowed"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPerms;

    #[test]
    fn snapshot_id_matches_known_vector() {
        assert_eq!(
            instructions_to_snapshot_id(b"Silifuzz"),
            "679016f223a6925ba69f055f513ea8aa0e0720ed"
        );
    }

    #[test]
    fn snapshot_id_is_40_lowercase_hex_chars() {
        let id = instructions_to_snapshot_id(&[0xCC]);
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn lift_x86_64_int3() {
        let config = FuzzingConfigX86_64::default();
        let snapshot = instructions_to_snapshot_x86_64(&[0xCC], &config).unwrap();

        // data page + code page
        assert_eq!(snapshot.num_pages(), 2);
        assert!(snapshot.is_complete(Completeness::UndefinedEndState).is_ok());

        let registers = snapshot.registers().unwrap();
        let rip = registers.instruction_pointer();
        assert!(rip >= config.code_range.start_address);
        assert!(rip < config.code_range.start_address + config.code_range.num_bytes);
        assert_eq!(
            registers.stack_pointer(),
            config.data1_range.start_address + PAGE_SIZE
        );
    }

    #[test]
    fn lift_x86_64_with_edited_ucontext() {
        let config = FuzzingConfigX86_64::default();
        let instruction = [0x90]; // nop
        let mut ucontext = generate_ucontext_x86_64(&instruction, &config);

        // Force the executable page to the start of the code range and shift
        // the stack upwards.
        let expected_entry_point = config.code_range.start_address;
        ucontext.instruction_pointer = expected_entry_point;
        let stack_start = config.data1_range.start_address + PAGE_SIZE * 4;
        let expected_stack_pointer = stack_start + PAGE_SIZE;
        ucontext.stack_pointer = expected_stack_pointer;

        let snapshot =
            instructions_to_snapshot_x86_64_with_ucontext(&instruction, &ucontext, &config)
                .unwrap();
        assert_eq!(snapshot.num_pages(), 2);
        assert!(snapshot.is_complete(Completeness::UndefinedEndState).is_ok());

        let registers = snapshot.registers().unwrap();
        assert_eq!(registers.instruction_pointer(), expected_entry_point);
        assert_eq!(registers.stack_pointer(), expected_stack_pointer);

        let mut executable_mappings = 0;
        for mapping in snapshot.memory_mappings() {
            if mapping.perms().has(MemoryPerms::x()) {
                executable_mappings += 1;
                assert_eq!(mapping.start_address(), expected_entry_point);
            } else {
                assert_eq!(mapping.start_address(), stack_start);
            }
        }
        assert_eq!(executable_mappings, 1);
    }

    #[test]
    fn lift_x86_64_is_stable_across_invocations() {
        let a = instructions_to_snapshot_x86_64(&[0xAA], &FuzzingConfigX86_64::default()).unwrap();
        let b = instructions_to_snapshot_x86_64(&[0xAA], &FuzzingConfigX86_64::default()).unwrap();
        assert_eq!(
            a.registers().unwrap().instruction_pointer(),
            b.registers().unwrap().instruction_pointer()
        );
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn lift_aarch64_nop() {
        let config = FuzzingConfigAArch64::default();
        let instruction = [0x1f, 0x20, 0x03, 0xd5]; // nop
        let snapshot = instructions_to_snapshot_aarch64(&instruction, &config).unwrap();

        assert_eq!(snapshot.num_pages(), 2);
        assert!(snapshot.is_complete(Completeness::UndefinedEndState).is_ok());

        let registers = snapshot.registers().unwrap();
        let pc = registers.instruction_pointer();
        assert!(pc >= config.code_range.start_address);
        assert!(pc < config.code_range.start_address + config.code_range.num_bytes);
        assert_eq!(
            registers.stack_pointer(),
            config.stack_range.start_address + config.stack_range.num_bytes
        );
    }

    #[test]
    fn lift_aarch64_with_edited_ucontext() {
        let config = FuzzingConfigAArch64::default();
        let instruction = [0x1f, 0x20, 0x03, 0xd5]; // nop
        let mut ucontext = generate_ucontext_aarch64(&instruction, &config);

        let expected_entry_point = config.code_range.start_address;
        ucontext.instruction_pointer = expected_entry_point;
        let stack_start = config.stack_range.start_address + PAGE_SIZE * 2;
        let expected_stack_pointer = stack_start + PAGE_SIZE;
        ucontext.stack_pointer = expected_stack_pointer;

        let snapshot =
            instructions_to_snapshot_aarch64_with_ucontext(&instruction, &ucontext, &config)
                .unwrap();
        assert_eq!(snapshot.num_pages(), 2);

        for mapping in snapshot.memory_mappings() {
            if mapping.perms().has(MemoryPerms::x()) {
                assert_eq!(mapping.start_address(), expected_entry_point);
            } else {
                assert_eq!(mapping.start_address(), stack_start);
            }
        }
    }

    #[test]
    fn aarch64_instruction_filter_matrix() {
        // sqdecb x11, vl8, mul #16
        let sve_insn = [0x0b, 0xf9, 0x3f, 0x04];
        // ldumax w5, w1, [x7]
        let load_insn = [0xe1, 0x60, 0x25, 0xb8];
        // ld1d z0.d, p0/z, [x0]
        let load_sve_insn = [0x00, 0xa0, 0xe0, 0xa5];

        let lift = |insn: &[u8], sve: bool, load_store: bool| {
            let mut config = FuzzingConfigAArch64::default();
            config.instruction_filter.sve_instructions_allowed = sve;
            config.instruction_filter.load_store_instructions_allowed = load_store;
            instructions_to_snapshot_aarch64(insn, &config)
        };
        let rejected = |result: Result<Snapshot, LiftError>| {
            matches!(result, Err(LiftError::InvalidArgument(_)))
        };

        assert!(rejected(lift(&sve_insn, false, false)));
        assert!(rejected(lift(&load_insn, false, false)));
        assert!(rejected(lift(&load_sve_insn, false, false)));

        assert!(rejected(lift(&sve_insn, false, true)));
        assert!(lift(&load_insn, false, true).is_ok());
        assert!(rejected(lift(&load_sve_insn, false, true)));

        assert!(lift(&sve_insn, true, true).is_ok());
        assert!(lift(&load_insn, true, true).is_ok());
        assert!(lift(&load_sve_insn, true, true).is_ok());

        assert!(lift(&sve_insn, true, false).is_ok());
        assert!(rejected(lift(&load_insn, true, false)));
        assert!(rejected(lift(&load_sve_insn, true, false)));
    }

    #[test]
    fn lift_rejects_empty_and_oversized_sequences() {
        let config = FuzzingConfigX86_64::default();
        assert!(matches!(
            instructions_to_snapshot_x86_64(&[], &config),
            Err(LiftError::InvalidArgument(_))
        ));
        let oversized = vec![0x90u8; PAGE_SIZE as usize];
        assert!(matches!(
            instructions_to_snapshot_x86_64(&oversized, &config),
            Err(LiftError::InvalidArgument(_))
        ));
    }

    #[test]
    fn lift_aarch64_rejects_misaligned_sequence() {
        let config = FuzzingConfigAArch64::default();
        assert!(matches!(
            instructions_to_snapshot_aarch64(&[0x1f, 0x20, 0x03], &config),
            Err(LiftError::InvalidArgument(_))
        ));
    }

    #[test]
    fn code_page_bytes_are_padded_with_traps() {
        let snapshot =
            instructions_to_snapshot_x86_64(&[0x90], &FuzzingConfigX86_64::default()).unwrap();
        let code_start = snapshot.registers().unwrap().instruction_pointer();
        let code_bytes = snapshot
            .memory_bytes()
            .iter()
            .find(|b| b.start_address() == code_start)
            .unwrap();
        assert_eq!(code_bytes.num_bytes(), PAGE_SIZE);
        assert_eq!(code_bytes.byte_values()[0], 0x90);
        assert_eq!(code_bytes.byte_values()[1], 0xCC);
    }
}
