use crate::arch::PAGE_SIZE;
use crate::corpus::layout::{Snap, SnapArray, SnapCorpus, SnapMemoryBytes, SNAP_CORPUS_MAGIC};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::mem::{align_of, size_of};
use std::path::Path;
use thiserror::Error;

/// Relocation failures. On any of these the input mapping is released; the
/// caller never observes partially-relocated state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationError {
    /// The mapping is zero bytes long.
    #[error("corpus mapping is empty")]
    EmptyCorpus,

    /// A relocated pointer (or the tail of an array) escapes the mapping.
    #[error("relocated pointer out of corpus bounds")]
    OutOfBound,

    /// A relocated pointer violates its referent's natural alignment.
    #[error("relocated pointer is misaligned")]
    Alignment,

    /// The header magic or type sizes do not match this build.
    #[error("corpus header contains bad data")]
    BadData,

    /// The kernel refused to write-protect the relocated mapping.
    #[error("failed to write-protect corpus mapping")]
    Mprotect,
}

/// Errors raised by [`RelocatedCorpus::load`].
#[derive(Error, Debug)]
pub enum CorpusLoadError {
    #[error("corpus I/O error: {0}")]
    Io(String),

    /// Corpus files are written in whole pages; anything else is truncated
    /// or not a corpus.
    #[error("corpus file size {0} is not a multiple of the page size")]
    UnalignedSize(u64),

    #[error(transparent)]
    Relocation(#[from] RelocationError),
}

/// An owning handle to a relocated, read-only corpus mapping.
///
/// Every pointer reachable from the contained [`SnapCorpus`] points back
/// into the mapping, so borrows handed out by the accessors are valid for
/// the lifetime of the handle. Dropping the handle unmaps the corpus. The
/// mapping is immutable after relocation; sharing `&RelocatedCorpus` across
/// threads needs no further synchronization.
pub struct RelocatedCorpus {
    mapping: Mmap,
}

impl RelocatedCorpus {
    /// Maps the corpus file at `path` copy-on-write and relocates it.
    pub fn load(path: &Path) -> Result<Self, CorpusLoadError> {
        debug_assert_eq!(page_size(), PAGE_SIZE);
        let file = std::fs::File::open(path)
            .map_err(|e| CorpusLoadError::Io(format!("failed to open {path:?}: {e}")))?;
        let file_size = file
            .metadata()
            .map_err(|e| CorpusLoadError::Io(format!("failed to stat {path:?}: {e}")))?
            .len();
        if file_size == 0 {
            return Err(RelocationError::EmptyCorpus.into());
        }
        if file_size % PAGE_SIZE != 0 {
            return Err(CorpusLoadError::UnalignedSize(file_size));
        }
        let mapping = unsafe { MmapOptions::new().map_copy(&file) }
            .map_err(|e| CorpusLoadError::Io(format!("failed to map {path:?}: {e}")))?;
        Ok(SnapRelocator::relocate(mapping)?)
    }

    pub fn corpus(&self) -> &SnapCorpus {
        // Relocation validated the header's bounds and alignment.
        unsafe { &*(self.mapping.as_ptr() as *const SnapCorpus) }
    }

    pub fn num_snaps(&self) -> usize {
        self.corpus().snaps.size as usize
    }

    pub fn snap(&self, index: usize) -> Option<&Snap> {
        let snaps = unsafe { self.corpus().snaps.as_slice() };
        snaps.get(index).map(|&snap| unsafe { &*snap })
    }

    pub fn snaps(&self) -> impl Iterator<Item = &Snap> {
        (0..self.num_snaps()).filter_map(move |i| self.snap(i))
    }

    pub fn byte_len(&self) -> usize {
        self.mapping.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mapping
    }
}

/// Rewrites a relocatable corpus image in place: every stored file offset
/// becomes a live pointer into the mapping, each validated for bounds and
/// alignment, after which the mapping is flipped read-only.
///
/// Single linear pass; no pointer is followed twice.
pub struct SnapRelocator {
    start_address: usize,
    limit_address: usize,
}

impl SnapRelocator {
    /// Relocates `mapping` and returns the read-only owning handle. On any
    /// error the mapping is dropped (unmapped) and only the error escapes.
    pub fn relocate(mut mapping: MmapMut) -> Result<RelocatedCorpus, RelocationError> {
        if mapping.len() == 0 {
            return Err(RelocationError::EmptyCorpus);
        }
        let start_address = mapping.as_mut_ptr() as usize;
        let relocator = SnapRelocator {
            start_address,
            limit_address: start_address + mapping.len(),
        };
        // Safety: the relocator only writes within [start, limit), which the
        // MmapMut exclusively owns.
        unsafe { relocator.relocate_corpus()? };
        let mapping = mapping
            .make_read_only()
            .map_err(|_| RelocationError::Mprotect)?;
        Ok(RelocatedCorpus { mapping })
    }

    // The whole referent must be inside the mapping and naturally aligned.
    fn validate_relocated_address<T>(&self, address: usize) -> Result<(), RelocationError> {
        let end = address
            .checked_add(size_of::<T>())
            .ok_or(RelocationError::OutOfBound)?;
        if address < self.start_address || end > self.limit_address {
            return Err(RelocationError::OutOfBound);
        }
        if address % align_of::<T>() != 0 {
            return Err(RelocationError::Alignment);
        }
        Ok(())
    }

    // Reads `ptr` as an offset from the corpus start, validates the target,
    // and stores the live address back.
    unsafe fn adjust_pointer<T>(&self, ptr: &mut *const T) -> Result<(), RelocationError> {
        let adjusted = (*ptr as usize)
            .checked_add(self.start_address)
            .ok_or(RelocationError::OutOfBound)?;
        self.validate_relocated_address::<T>(adjusted)?;
        *ptr = adjusted as *const T;
        Ok(())
    }

    // Adjusts an array's elements pointer and validates the address of its
    // last element; the first element is covered by adjust_pointer. Checking
    // the tail catches oversized `size` fields without a separate overflow
    // guard at every use site.
    unsafe fn adjust_array<T>(&self, array: &mut SnapArray<T>) -> Result<(), RelocationError> {
        if array.size == 0 {
            array.elements = std::ptr::null();
            return Ok(());
        }
        self.adjust_pointer(&mut array.elements)?;
        let tail_offset = (array.size as usize - 1)
            .checked_mul(size_of::<T>())
            .ok_or(RelocationError::OutOfBound)?;
        let tail_address = (array.elements as usize)
            .checked_add(tail_offset)
            .ok_or(RelocationError::OutOfBound)?;
        self.validate_relocated_address::<T>(tail_address)
    }

    unsafe fn relocate_memory_bytes_array(
        &self,
        array: &mut SnapArray<SnapMemoryBytes>,
    ) -> Result<(), RelocationError> {
        self.adjust_array(array)?;
        for i in 0..array.size as usize {
            let record = &mut *(array.elements.add(i) as *mut SnapMemoryBytes);
            if !record.repeating() {
                self.adjust_array(&mut record.data.byte_values)?;
            }
        }
        Ok(())
    }

    // The id must have a NUL before the end of the mapping so string
    // accessors cannot scan out of bounds.
    unsafe fn validate_id_string(&self, id: *const u8) -> Result<(), RelocationError> {
        let mut address = id as usize;
        while address < self.limit_address {
            if *(address as *const u8) == 0 {
                return Ok(());
            }
            address += 1;
        }
        Err(RelocationError::BadData)
    }

    unsafe fn relocate_corpus(&self) -> Result<(), RelocationError> {
        // The mapping is known to start at start_address; check that the
        // header itself fits and is aligned.
        self.validate_relocated_address::<SnapCorpus>(self.start_address)?;
        let corpus = &mut *(self.start_address as *mut SnapCorpus);

        // If this constant isn't at the start of the file, it's likely not a
        // corpus at all.
        if corpus.magic != SNAP_CORPUS_MAGIC {
            return Err(RelocationError::BadData);
        }
        // These size checks refuse corpora generated for a differently
        // configured runner.
        if corpus.corpus_type_size != size_of::<SnapCorpus>() as u64 {
            return Err(RelocationError::BadData);
        }
        if corpus.snap_type_size != size_of::<Snap>() as u64 {
            return Err(RelocationError::BadData);
        }
        if corpus.register_state_type_size
            != size_of::<crate::corpus::layout::SnapRegisterState>() as u64
        {
            return Err(RelocationError::BadData);
        }

        self.adjust_array(&mut corpus.snaps)?;
        for i in 0..corpus.snaps.size as usize {
            let slot = &mut *(corpus.snaps.elements.add(i) as *mut *const Snap);
            self.adjust_pointer(slot)?;

            let snap = &mut *(*slot as *mut Snap);
            self.adjust_pointer(&mut snap.id)?;
            self.validate_id_string(snap.id)?;
            self.adjust_array(&mut snap.memory_mappings)?;
            self.adjust_pointer(&mut snap.registers)?;
            self.adjust_pointer(&mut snap.end_state_registers)?;
            self.relocate_memory_bytes_array(&mut snap.memory_bytes)?;
            self.relocate_memory_bytes_array(&mut snap.end_state_memory_bytes)?;
        }
        Ok(())
    }
}

fn page_size() -> u64 {
    // Cross-check the constant against the kernel in debug builds.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}
