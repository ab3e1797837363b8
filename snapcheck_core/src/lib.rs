pub mod arch;
pub mod byte_set;
pub mod config;
pub mod corpus;
pub mod driver;
pub mod insns;
pub mod maker;
pub mod memory;
pub mod platform;
pub mod snapify;
pub mod snapshot;
pub mod tracer;

pub use arch::{Arch, PAGE_SIZE};
pub use byte_set::MemoryByteSet;
pub use config::FixToolConfig;
pub use corpus::builder::{build_corpus, write_corpus_file, BuilderError};
pub use corpus::relocator::{CorpusLoadError, RelocatedCorpus, RelocationError, SnapRelocator};
pub use driver::{
    CommandRunnerDriver, DriverError, PlaybackOutcome, RunResult, RunnerDriver, TraceStep,
};
pub use insns::{
    instructions_to_snapshot_aarch64, instructions_to_snapshot_id, instructions_to_snapshot_x86_64,
    FuzzingConfigAArch64, FuzzingConfigX86_64, LiftError,
};
pub use maker::{MakerError, MakerStopReason, SnapMaker, SnapMakerOptions};
pub use memory::{MemoryBytes, MemoryMapping, MemoryPerms};
pub use platform::{current_platform_id, PlatformId};
pub use snapify::{snapify, SnapifyOptions};
pub use snapshot::{Completeness, EndState, Endpoint, RegisterState, Snapshot, SnapshotError};
pub use tracer::{DisassemblingSnapTracer, TraceOptions, TraceResult};
