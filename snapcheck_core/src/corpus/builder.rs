use crate::arch::round_up_to_page;
use crate::corpus::layout::{
    SNAP_CORPUS_MAGIC, SNAP_GREGS_SIZE, Snap, SnapCorpus, SnapMemoryBytes, SnapMemoryMapping,
    SnapRegisterState,
};
use crate::snapshot::{Completeness, RegisterState, Snapshot};
use std::path::Path;
use thiserror::Error;

/// Errors raised while serializing snapshots into corpus form.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// The snapshot is not fully recorded and cannot be a corpus member.
    #[error("snapshot {0} is not corpus-ready: {1}")]
    IncompleteSnapshot(String, String),

    /// Corpus members carry exactly one expected end state.
    #[error("snapshot {0} has {1} expected end states, corpus members need exactly 1")]
    EndStateCount(String, usize),

    /// The opaque register block exceeds the fixed corpus record.
    #[error("snapshot {0} has {1} bytes of gregs, the corpus record holds {2}")]
    RegistersTooLarge(String, usize, usize),

    #[error("corpus I/O error: {0}")]
    Io(String),
}

// Append-only image with offset patching. All multi-byte fields are
// little-endian.
struct ImageWriter {
    buf: Vec<u8>,
}

impl ImageWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn align_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }

    // Reserves `size` zeroed bytes at the given alignment and returns their
    // offset.
    fn reserve(&mut self, size: usize, align: usize) -> u64 {
        self.align_to(align);
        let offset = self.buf.len() as u64;
        self.buf.resize(self.buf.len() + size, 0);
        offset
    }

    fn append_bytes(&mut self, bytes: &[u8], align: usize) -> u64 {
        self.align_to(align);
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        offset
    }

    fn put_u64(&mut self, offset: u64, value: u64) {
        let offset = offset as usize;
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_array(&mut self, offset: u64, size: u64, elements: u64) {
        self.put_u64(offset, size);
        self.put_u64(offset + 8, elements);
    }
}

fn register_record(id: &str, registers: &RegisterState) -> Result<Vec<u8>, BuilderError> {
    if registers.gregs().len() > SNAP_GREGS_SIZE {
        return Err(BuilderError::RegistersTooLarge(
            id.to_string(),
            registers.gregs().len(),
            SNAP_GREGS_SIZE,
        ));
    }
    let mut record = Vec::with_capacity(std::mem::size_of::<SnapRegisterState>());
    record.extend_from_slice(&registers.instruction_pointer().to_le_bytes());
    record.extend_from_slice(&registers.stack_pointer().to_le_bytes());
    record.extend_from_slice(registers.gregs());
    record.resize(std::mem::size_of::<SnapRegisterState>(), 0);
    Ok(record)
}

// Emits an array of SnapMemoryBytes records plus the literal byte arrays
// non-repeating entries reference.
fn write_memory_bytes_array(
    writer: &mut ImageWriter,
    regions: &[crate::memory::MemoryBytes],
) -> (u64, u64) {
    let record_size = std::mem::size_of::<SnapMemoryBytes>();
    let array_offset = writer.reserve(record_size * regions.len(), 8);
    for (i, region) in regions.iter().enumerate() {
        let record_offset = array_offset + (i * record_size) as u64;
        writer.put_u64(record_offset, region.start_address());
        writer.put_u64(record_offset + 8, region.num_bytes());
        if region.repeating() {
            writer.put_u64(record_offset + 16, 1);
            // The union's fill_byte occupies the first byte of the payload.
            let fill = region.byte_values()[0];
            writer.buf[(record_offset + 24) as usize] = fill;
        } else {
            writer.put_u64(record_offset + 16, 0);
            let elements = writer.append_bytes(region.byte_values(), 1);
            writer.put_array(record_offset + 24, region.num_bytes(), elements);
        }
    }
    (regions.len() as u64, array_offset)
}

fn write_snap(writer: &mut ImageWriter, snapshot: &Snapshot) -> Result<u64, BuilderError> {
    snapshot
        .is_complete(Completeness::Complete)
        .map_err(|e| BuilderError::IncompleteSnapshot(snapshot.id().to_string(), e.to_string()))?;
    if snapshot.expected_end_states().len() != 1 {
        return Err(BuilderError::EndStateCount(
            snapshot.id().to_string(),
            snapshot.expected_end_states().len(),
        ));
    }
    let end_state = &snapshot.expected_end_states()[0];
    // is_complete(Complete) guarantees registers on both sides.
    let (Some(registers), Some(end_state_registers)) =
        (snapshot.registers(), end_state.registers())
    else {
        return Err(BuilderError::IncompleteSnapshot(
            snapshot.id().to_string(),
            "missing register state".to_string(),
        ));
    };

    let snap_offset = writer.reserve(std::mem::size_of::<Snap>(), 8);

    let mut id_bytes = snapshot.id().as_bytes().to_vec();
    id_bytes.push(0);
    let id_offset = writer.append_bytes(&id_bytes, 1);
    writer.put_u64(snap_offset, id_offset);

    let mapping_size = std::mem::size_of::<SnapMemoryMapping>();
    let mappings_offset = writer.reserve(mapping_size * snapshot.memory_mappings().len(), 8);
    for (i, mapping) in snapshot.memory_mappings().iter().enumerate() {
        let record_offset = mappings_offset + (i * mapping_size) as u64;
        writer.put_u64(record_offset, mapping.start_address());
        writer.put_u64(record_offset + 8, mapping.num_bytes());
        writer.put_u64(record_offset + 16, mapping.perms().to_bits() as u64);
    }
    writer.put_array(
        snap_offset + 8,
        snapshot.memory_mappings().len() as u64,
        mappings_offset,
    );

    let (size, elements) = write_memory_bytes_array(writer, snapshot.memory_bytes());
    writer.put_array(snap_offset + 24, size, elements);

    let (size, elements) = write_memory_bytes_array(writer, end_state.memory_bytes());
    writer.put_array(snap_offset + 40, size, elements);

    let record = register_record(snapshot.id(), registers)?;
    let registers_offset = writer.append_bytes(&record, 8);
    writer.put_u64(snap_offset + 56, registers_offset);

    let record = register_record(snapshot.id(), end_state_registers)?;
    let end_state_registers_offset = writer.append_bytes(&record, 8);
    writer.put_u64(snap_offset + 64, end_state_registers_offset);

    Ok(snap_offset)
}

/// Serializes finalized snapshots into a relocatable corpus image. Every
/// pointer field holds a byte offset from the start of the image; the image
/// length is padded to a whole number of pages.
pub fn build_corpus(snapshots: &[Snapshot]) -> Result<Vec<u8>, BuilderError> {
    let mut writer = ImageWriter::new();

    let header_offset = writer.reserve(std::mem::size_of::<SnapCorpus>(), 8);
    let slots_offset = writer.reserve(8 * snapshots.len(), 8);

    for (i, snapshot) in snapshots.iter().enumerate() {
        let snap_offset = write_snap(&mut writer, snapshot)?;
        writer.put_u64(slots_offset + (i * 8) as u64, snap_offset);
    }

    writer.put_u64(header_offset, SNAP_CORPUS_MAGIC);
    writer.put_u64(
        header_offset + 8,
        std::mem::size_of::<SnapCorpus>() as u64,
    );
    writer.put_u64(header_offset + 16, std::mem::size_of::<Snap>() as u64);
    writer.put_u64(
        header_offset + 24,
        std::mem::size_of::<SnapRegisterState>() as u64,
    );
    writer.put_array(
        header_offset + 32,
        snapshots.len() as u64,
        if snapshots.is_empty() { 0 } else { slots_offset },
    );

    let padded = round_up_to_page(writer.buf.len() as u64) as usize;
    writer.buf.resize(padded, 0);
    Ok(writer.buf)
}

/// Builds a corpus image and writes it to `path`.
pub fn write_corpus_file(snapshots: &[Snapshot], path: &Path) -> Result<(), BuilderError> {
    let image = build_corpus(snapshots)?;
    std::fs::write(path, image)
        .map_err(|e| BuilderError::Io(format!("failed to write {path:?}: {e}")))
}
