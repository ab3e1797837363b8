use crate::driver::TraceStep;
use crate::memory::MemoryPerms;
use crate::snapshot::Snapshot;

const CACHE_LINE_SIZE: u64 = 64;

/// Knobs for the single-step trace filter.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TraceOptions {
    /// Reject snapshots that execute a non-deterministic instruction
    /// (RDTSC, RDRAND and friends).
    pub filter_banned_instructions: bool,
    /// Reject snapshots whose locked accesses straddle a cache line.
    pub x86_filter_split_lock: bool,
    /// Maximum number of instructions a trace may execute.
    pub instruction_count_budget: u64,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            filter_banned_instructions: true,
            x86_filter_split_lock: true,
            instruction_count_budget: 1000,
        }
    }
}

/// What a trace produced: how far it got, the per-instruction disassembly,
/// and why it stopped early if it did.
#[derive(Clone, Debug, Default)]
pub struct TraceResult {
    pub instructions_executed: u64,
    pub disassembly: Vec<String>,
    pub early_termination_reason: Option<String>,
}

enum X86InsnKind {
    /// An instruction whose result varies between runs.
    NonDeterministic(&'static str),
    /// A LOCK-prefixed access.
    Locked,
    Other,
}

// Minimal x86 opcode matcher covering the instructions the filter bans.
// Full decode is the runner's job; the tracer only needs to spot the closed
// set of troublemakers among the bytes the runner already fetched.
fn classify_x86_instruction(bytes: &[u8]) -> X86InsnKind {
    let mut locked = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0xF0 => locked = true,
            0x66 | 0x67 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {}
            b if (0x40..=0x4F).contains(&b) => {} // REX
            _ => break,
        }
        i += 1;
    }
    let rest = &bytes[i..];
    let kind = match rest {
        [0x0F, 0x31, ..] => Some("rdtsc"),
        [0x0F, 0x01, 0xF9, ..] => Some("rdtscp"),
        [0x0F, 0xA2, ..] => Some("cpuid"),
        [0x0F, 0xC7, modrm, ..] => match (modrm >> 3) & 0x7 {
            6 => Some("rdrand"),
            7 => Some("rdseed"),
            _ => None,
        },
        _ => None,
    };
    match kind {
        Some(mnemonic) => X86InsnKind::NonDeterministic(mnemonic),
        None if locked => X86InsnKind::Locked,
        None => X86InsnKind::Other,
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-instruction filter fed by the runner's trace callbacks.
///
/// The tracer records a disassembly line per step and terminates the trace
/// early for: a non-deterministic instruction, a split-lock-generating
/// locked access, an instruction fetch outside the snapshot's executable
/// memory, or exceeding the instruction budget. The termination reason is
/// kept for the maker's error message.
pub struct DisassemblingSnapTracer<'s> {
    snapshot: &'s Snapshot,
    options: TraceOptions,
    result: TraceResult,
}

impl<'s> DisassemblingSnapTracer<'s> {
    pub fn new(snapshot: &'s Snapshot, options: TraceOptions) -> Self {
        Self {
            snapshot,
            options,
            result: TraceResult::default(),
        }
    }

    /// Consumes one trace step. Returns false to stop the trace.
    pub fn step(&mut self, step: &TraceStep) -> bool {
        self.result.instructions_executed += 1;
        if self.result.instructions_executed > self.options.instruction_count_budget {
            self.result.early_termination_reason = Some(format!(
                "executed more than {} instructions",
                self.options.instruction_count_budget
            ));
            return false;
        }

        if !self.fetch_is_in_executable_mapping(step.address) {
            self.result.early_termination_reason = Some(format!(
                "instruction fetch at {:#x} is outside the snapshot's executable memory",
                step.address
            ));
            return false;
        }

        let kind = classify_x86_instruction(&step.instruction_bytes);
        match kind {
            X86InsnKind::NonDeterministic(mnemonic) => {
                self.result
                    .disassembly
                    .push(format!("{:#x}: {mnemonic}", step.address));
                if self.options.filter_banned_instructions {
                    self.result.early_termination_reason = Some(format!(
                        "non-deterministic instruction {mnemonic} at {:#x}",
                        step.address
                    ));
                    return false;
                }
            }
            X86InsnKind::Locked => {
                self.result.disassembly.push(format!(
                    "{:#x}: lock {}",
                    step.address,
                    hex_bytes(&step.instruction_bytes)
                ));
                if self.options.x86_filter_split_lock && self.splits_cache_line(step) {
                    self.result.early_termination_reason = Some(format!(
                        "split-lock access at {:#x}",
                        step.address
                    ));
                    return false;
                }
            }
            X86InsnKind::Other => {
                self.result.disassembly.push(format!(
                    "{:#x}: {}",
                    step.address,
                    hex_bytes(&step.instruction_bytes)
                ));
            }
        }
        true
    }

    fn fetch_is_in_executable_mapping(&self, address: u64) -> bool {
        self.snapshot.memory_mappings().iter().any(|m| {
            m.perms().has(MemoryPerms::x())
                && m.start_address() <= address
                && address < m.limit_address()
        })
    }

    fn splits_cache_line(&self, step: &TraceStep) -> bool {
        match &step.memory_access {
            Some(access) if access.num_bytes > 0 => {
                let first_line = access.address / CACHE_LINE_SIZE;
                let last_line = (access.address + access.num_bytes - 1) / CACHE_LINE_SIZE;
                first_line != last_line
            }
            _ => false,
        }
    }

    pub fn trace_result(&self) -> &TraceResult {
        &self.result
    }

    pub fn into_trace_result(self) -> TraceResult {
        self.result
    }
}
