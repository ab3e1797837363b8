use crate::arch::Arch;
use crate::memory::MemoryBytes;
use crate::snapshot::{Completeness, Snapshot, SnapshotError};

/// Options for [`snapify`], keyed by architecture and pipeline mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SnapifyOptions {
    pub arch: Arch,
    /// Whether undefined (endpoint-only) end states are acceptable. True
    /// while making, false when preparing a snapshot for verification runs.
    pub allow_undefined_end_state: bool,
}

impl SnapifyOptions {
    /// Options for snapshots entering the maker: end states may still be
    /// undefined.
    pub fn v2_input_make_opts(arch: Arch) -> Self {
        Self {
            arch,
            allow_undefined_end_state: true,
        }
    }

    /// Options for snapshots about to be replayed: every end state must be
    /// complete.
    pub fn v2_input_run_opts(arch: Arch) -> Self {
        Self {
            arch,
            allow_undefined_end_state: false,
        }
    }

    fn completeness(&self) -> Completeness {
        if self.allow_undefined_end_state {
            Completeness::UndefinedEndState
        } else {
            Completeness::Complete
        }
    }
}

/// Canonicalizes a snapshot for the runner: validates completeness for the
/// requested mode, orders mappings and byte regions by address, and merges
/// adjacent byte regions. Pure; the input is never modified.
pub fn snapify(snapshot: &Snapshot, opts: &SnapifyOptions) -> Result<Snapshot, SnapshotError> {
    if snapshot.arch() != opts.arch {
        return Err(SnapshotError::InvalidArgument(format!(
            "snapshot {} is {} but snapify options are for {}",
            snapshot.id(),
            snapshot.arch(),
            opts.arch
        )));
    }
    snapshot.is_complete(opts.completeness())?;

    let mut mappings = snapshot.memory_mappings().to_vec();
    mappings.sort_by_key(|m| m.start_address());
    let mut negative = snapshot.negative_memory_mappings().to_vec();
    negative.sort_by_key(|m| m.start_address());

    let mut bytes = snapshot.memory_bytes().to_vec();
    bytes.sort_by_key(|b| b.start_address());
    let bytes = coalesce_adjacent(bytes)?;

    // Rebuild through a fresh snapshot so the normalized pieces re-validate.
    let mut canonical = Snapshot::new(snapshot.arch(), snapshot.id());
    for mapping in mappings {
        canonical.add_memory_mapping(mapping)?;
    }
    for region in bytes {
        canonical.add_memory_bytes(region)?;
    }
    if let Some(registers) = snapshot.registers() {
        canonical.set_registers(registers.clone());
    }
    for end_state in snapshot.expected_end_states() {
        canonical.add_expected_end_state(end_state.clone())?;
    }
    canonical.set_negative_memory_mappings(negative);
    canonical.set_trace_data(snapshot.trace_data().to_vec());

    canonical.is_complete(opts.completeness())?;
    Ok(canonical)
}

// Merges byte regions that touch end-to-start. Input must be sorted by start
// address and non-overlapping.
fn coalesce_adjacent(regions: Vec<MemoryBytes>) -> Result<Vec<MemoryBytes>, SnapshotError> {
    let mut out: Vec<MemoryBytes> = Vec::with_capacity(regions.len());
    for region in regions {
        match out.last() {
            Some(last) if last.limit_address() == region.start_address() => {
                let mut merged = last.byte_values().to_vec();
                merged.extend_from_slice(region.byte_values());
                let start = last.start_address();
                out.pop();
                out.push(MemoryBytes::new(start, merged)?);
            }
            _ => out.push(region),
        }
    }
    Ok(out)
}
