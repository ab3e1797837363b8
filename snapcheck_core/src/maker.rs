use crate::arch::{is_page_aligned, Arch};
use crate::byte_set::MemoryByteSet;
use crate::driver::{
    CommandRunnerDriver, DriverError, PlaybackOutcome, RunnerDriver,
};
use crate::memory::{
    reserved_memory_mappings, MemoryBytes, MemoryError, MemoryMapping, MemoryPerms,
};
use crate::platform::current_platform_id;
use crate::snapify::{snapify, SnapifyOptions};
use crate::snapshot::{
    Completeness, EndState, Endpoint, SigCause, SigNum, Snapshot, SnapshotError,
};
use crate::tracer::{DisassemblingSnapTracer, TraceOptions};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Why the maker stopped driving a snapshot. `Endpoint` is the one fixable
/// reason; everything else means the input is not Snap-compatible.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MakerStopReason {
    /// Execution stopped at a concrete endpoint with a repairable mismatch.
    Endpoint,
    /// Execution hit a SIGTRAP.
    SigTrap,
    /// The runner could not repair a read/write fault by adding pages.
    CannotAddMemory,
    /// Execution raised a general-protection SIGSEGV.
    GeneralProtectionSigSegv,
    /// Execution raised a SIGSEGV that cannot be repaired by adding memory.
    HardSigSegv,
    /// Execution stopped on some other signal.
    Signal,
    /// Execution exceeded its time budget.
    TimeBudget,
}

impl std::fmt::Display for MakerStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MakerStopReason::Endpoint => "Endpoint",
            MakerStopReason::SigTrap => "SigTrap",
            MakerStopReason::CannotAddMemory => "CannotAddMemory",
            MakerStopReason::GeneralProtectionSigSegv => "GeneralProtectionSigSegv",
            MakerStopReason::HardSigSegv => "HardSigSegv",
            MakerStopReason::Signal => "Signal",
            MakerStopReason::TimeBudget => "TimeBudget",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the maker pipeline. None are recovered locally; the
/// first failing stage aborts the pipeline.
#[derive(Error, Debug)]
pub enum MakerError {
    /// Malformed options or a malformed snapshot.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A contradictory runner result or a missing actual end state.
    #[error("internal: {0}")]
    Internal(String),

    /// The snapshot stopped for a terminal reason and cannot become a Snap.
    /// Callers typically discard the candidate.
    #[error("{reason} isn't Snap-compatible.{details}")]
    SnapIncompatible {
        reason: MakerStopReason,
        details: String,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Construction-time knobs for [`SnapMaker`].
#[derive(Clone, Debug)]
pub struct SnapMakerOptions {
    /// Location of the runner binary.
    pub runner_path: PathBuf,

    /// How many RW memory pages `make` may add to repair page faults.
    pub max_pages_to_add: u64,

    /// How many times `verify_plays_deterministically` plays each snapshot.
    /// Higher values give more confidence the snapshot is deterministic.
    /// Must be at least 1.
    pub num_verify_attempts: usize,
}

impl Default for SnapMakerOptions {
    fn default() -> Self {
        Self {
            runner_path: PathBuf::new(),
            max_pages_to_add: 5,
            num_verify_attempts: 5,
        }
    }
}

impl SnapMakerOptions {
    pub fn validate(&self) -> Result<(), MakerError> {
        if self.runner_path.as_os_str().is_empty() {
            return Err(MakerError::InvalidArgument(
                "runner_path must be non-empty".to_string(),
            ));
        }
        if self.num_verify_attempts == 0 {
            return Err(MakerError::InvalidArgument(
                "num_verify_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// The repair/classify state machine that turns candidate snapshots into
/// Snap-compatible, deterministic ones.
///
/// The pipeline for a candidate is strictly sequential:
///
/// ```text
/// make() -> record_end_state() -> verify_plays_deterministically()
///        -> check_trace()
/// ```
///
/// Thread-compatible: the maker holds no mutable state after construction,
/// so an instance may serve concurrent calls on disjoint snapshots as long
/// as the underlying driver supports concurrent subprocess invocations.
pub struct SnapMaker {
    opts: SnapMakerOptions,
    driver: Box<dyn RunnerDriver>,
}

impl SnapMaker {
    /// Creates a maker that drives the runner binary at
    /// `opts.runner_path`.
    pub fn new(opts: SnapMakerOptions) -> Result<Self, MakerError> {
        opts.validate()?;
        let driver = Box::new(CommandRunnerDriver::new(&opts.runner_path)?);
        Ok(Self { opts, driver })
    }

    /// Creates a maker over a caller-supplied driver.
    pub fn with_driver(
        opts: SnapMakerOptions,
        driver: Box<dyn RunnerDriver>,
    ) -> Result<Self, MakerError> {
        opts.validate()?;
        Ok(Self { opts, driver })
    }

    pub fn options(&self) -> &SnapMakerOptions {
        &self.opts
    }

    /// Converts a snapshot into a potentially Snap-compatible snapshot.
    ///
    /// Replaces the expected end states with a single undefined one, plays
    /// the snapshot under the runner, and classifies the outcome. A fixable
    /// outcome (memory or register mismatch at a concrete endpoint) grows
    /// the snapshot's writable memory as needed and returns it with exactly
    /// one undefined end state anchored at the observed endpoint, ready for
    /// [`SnapMaker::record_end_state`]. Every other outcome is an error.
    pub fn make(&self, snapshot: &Snapshot) -> Result<Snapshot, MakerError> {
        let first_end_state = snapshot.expected_end_states().first().ok_or_else(|| {
            MakerError::InvalidArgument(format!(
                "snapshot {} has no expected end states",
                snapshot.id()
            ))
        })?;
        // Anchor the undefined end state at the instruction address or, for
        // signal endpoints, at the faulting instruction. The latter cases
        // won't always be repairable.
        let orig_endpoint_address = first_end_state.endpoint().stop_instruction_address();

        let mut copy = snapshot.clone();
        copy.set_expected_end_states(Vec::new());
        copy.set_negative_memory_mappings(Vec::new());
        let undef_end_state = EndState::undefined(orig_endpoint_address);
        copy.can_add_expected_end_state(&undef_end_state)
            .map_err(|e| {
                MakerError::InvalidArgument(format!("cannot add an undef endstate: {e}"))
            })?;
        copy.add_expected_end_state(undef_end_state)?;

        let snapify_opts = SnapifyOptions::v2_input_make_opts(copy.arch());
        let mut copy = snapify(&copy, &snapify_opts)?;

        let make_result = self.driver.make_one(&copy, self.opts.max_pages_to_add)?;
        if make_result.success() {
            // In practice this can happen if the snapshot hits just the
            // right instruction sequence to call _exit(0), either by jumping
            // into a library function or by invoking the syscall directly.
            warn!(snap_id = copy.id(), "made snapshot ran successfully with an undefined end state");
            return Err(MakerError::Internal(format!(
                "Unlikely: snapshot {} had an undefined end state yet ran successfully",
                copy.id()
            )));
        }

        let player_result = make_result.player_result();
        let stop_reason = match player_result.outcome {
            PlaybackOutcome::AsExpected => {
                return Err(MakerError::Internal(format!(
                    "Impossible: snapshot {} did not run successfully but ended as expected",
                    copy.id()
                )));
            }
            PlaybackOutcome::MemoryMismatch | PlaybackOutcome::RegisterStateMismatch => {
                MakerStopReason::Endpoint
            }
            PlaybackOutcome::ExecutionMisbehave => {
                let endpoint = Self::actual_endpoint(player_result.actual_end_state.as_ref())?;
                match endpoint {
                    Endpoint::Signal {
                        sig_num: SigNum::SigTrap,
                        ..
                    } => {
                        debug!("stopping due to SIGTRAP");
                        MakerStopReason::SigTrap
                    }
                    Endpoint::Signal {
                        sig_num: SigNum::SigSegv,
                        sig_cause,
                        ..
                    } => match sig_cause {
                        // The runner fixes up missing pages by adding them to
                        // the snapshot. Reaching here means it failed to add
                        // memory for a R/W fault.
                        SigCause::SegvCantRead | SigCause::SegvCantWrite => {
                            MakerStopReason::CannotAddMemory
                        }
                        SigCause::SegvGeneralProtection => {
                            MakerStopReason::GeneralProtectionSigSegv
                        }
                        SigCause::SegvCantExec
                        | SigCause::SegvOverflow
                        | SigCause::GenericSigCause => MakerStopReason::HardSigSegv,
                    },
                    Endpoint::Signal { .. } => MakerStopReason::Signal,
                    Endpoint::Instruction { .. } => {
                        return Err(MakerError::Internal(format!(
                            "snapshot {} misbehaved without a signal endpoint",
                            copy.id()
                        )));
                    }
                }
            }
            PlaybackOutcome::ExecutionRunaway => MakerStopReason::TimeBudget,
            PlaybackOutcome::EndpointMismatch | PlaybackOutcome::PlatformMismatch => {
                return Err(MakerError::Internal(format!(
                    "Unsupported outcome {:?}",
                    player_result.outcome
                )));
            }
        };

        let actual_end_state = Self::actual_end_state(player_result.actual_end_state.as_ref())?;
        let actual_endpoint = actual_end_state.endpoint().clone();

        if stop_reason != MakerStopReason::Endpoint {
            let details = match &actual_endpoint {
                Endpoint::Signal {
                    sig_num, sig_cause, ..
                } => format!(" Endpoint = {{{sig_num}/{sig_cause}}}"),
                Endpoint::Instruction { .. } => String::new(),
            };
            return Err(MakerError::SnapIncompatible {
                reason: stop_reason,
                details,
            });
        }
        debug!(
            "reached a fixable outcome at {:#x}",
            actual_endpoint.stop_instruction_address()
        );

        Self::add_writable_memory_for_end_state(&mut copy, actual_end_state)?;

        // Still undefined in the register-state sense, but now anchored at
        // the endpoint the runner observed.
        let repaired_end_state = EndState::undefined_at(actual_endpoint);
        copy.set_expected_end_states(Vec::new());
        copy.can_add_expected_end_state(&repaired_end_state)?;
        copy.add_expected_end_state(repaired_end_state)?;
        Ok(copy)
    }

    /// Records an expected end state for the input snapshot.
    ///
    /// Returns a snapshot with exactly one complete expected end state,
    /// stamped with the current platform. Page growth is disabled here;
    /// [`SnapMaker::make`] already did that.
    pub fn record_end_state(&self, snapshot: &Snapshot) -> Result<Snapshot, MakerError> {
        let snapify_opts = SnapifyOptions::v2_input_make_opts(snapshot.arch());
        let mut snapified = snapify(snapshot, &snapify_opts)?;
        let record_result = self.driver.make_one(&snapified, 0)?;
        if record_result.success() {
            snapified.is_complete(Completeness::Complete)?;
            return Ok(snapified);
        }
        let mut actual_end_state = record_result
            .player_result()
            .actual_end_state
            .clone()
            .ok_or_else(|| {
                MakerError::Internal("The runner didn't report actual_end_state".to_string())
            })?;
        actual_end_state.set_platforms(vec![current_platform_id()]);
        snapified.set_expected_end_states(Vec::new());
        snapified.add_negative_memory_mappings_for(&actual_end_state)?;
        snapified.can_add_expected_end_state(&actual_end_state)?;
        snapified.add_expected_end_state(actual_end_state)?;
        snapified.is_complete(Completeness::Complete)?;
        Ok(snapified)
    }

    /// Verifies the snapshot plays deterministically, i.e. reaches the same
    /// expected end state when played `num_verify_attempts` times.
    pub fn verify_plays_deterministically(&self, snapshot: &Snapshot) -> Result<(), MakerError> {
        let snapify_opts = SnapifyOptions::v2_input_run_opts(snapshot.arch());
        let snapified = snapify(snapshot, &snapify_opts)?;
        let verify_result = self
            .driver
            .verify_one_repeatedly(&snapified, self.opts.num_verify_attempts)?;
        if !verify_result.success() {
            if let Some(actual) = &verify_result.player_result().actual_end_state {
                debug!(
                    snap_id = snapified.id(),
                    expected = ?snapified.expected_end_states().first(),
                    actual = ?actual,
                    "end state mismatch during verification"
                );
            }
            return Err(MakerError::Internal(
                "Verify() failed, non-deterministic snapshot?".to_string(),
            ));
        }
        Ok(())
    }

    /// Single-steps the snapshot and rejects it if it executes a
    /// non-deterministic instruction, causes a split lock, or runs past the
    /// trace budget. On success the captured disassembly is attached as
    /// trace data.
    ///
    /// Dynamic tracing exists on x86_64 only; on AArch64 the snapshot is
    /// returned unchanged.
    // TODO: instruction filtering on aarch64. This will likely involve
    // static decompilation rather than dynamic tracing.
    pub fn check_trace(
        &self,
        snapshot: &Snapshot,
        trace_options: &TraceOptions,
    ) -> Result<Snapshot, MakerError> {
        let mut copy = snapshot.clone();
        match copy.arch() {
            Arch::AArch64 => Ok(copy),
            Arch::X86_64 => {
                let mut tracer = DisassemblingSnapTracer::new(snapshot, trace_options.clone());
                let trace_result_or = self
                    .driver
                    .trace_one(snapshot, &mut |step| tracer.step(step));
                let trace_result = tracer.into_trace_result();
                let traced_ok = matches!(&trace_result_or, Ok(r) if r.success());
                if !traced_ok {
                    return Err(MakerError::Internal(format!(
                        "Tracing failed: {}",
                        trace_result.early_termination_reason.unwrap_or_default()
                    )));
                }
                let mut trace_data = crate::snapshot::TraceData::new(
                    trace_result.instructions_executed,
                    trace_result.disassembly.join("\n"),
                );
                trace_data.add_platform(current_platform_id());
                copy.set_trace_data(vec![trace_data]);
                Ok(copy)
            }
        }
    }

    fn actual_end_state<'a>(
        actual: Option<&'a EndState>,
    ) -> Result<&'a EndState, MakerError> {
        actual.ok_or_else(|| {
            MakerError::Internal("The runner didn't report actual_end_state".to_string())
        })
    }

    fn actual_endpoint(actual: Option<&EndState>) -> Result<&Endpoint, MakerError> {
        Ok(Self::actual_end_state(actual)?.endpoint())
    }

    /// Adds writable memory pages from `end_state` to `snapshot`: whatever
    /// the end state touched that the snapshot does not already map. Pages
    /// are added with RW (never X) permissions, zero-filled, and must not
    /// overlap the runner's reserved regions.
    ///
    /// Iteration continues after a per-interval failure; the first error is
    /// returned at the end and earlier mutations stay in place. Callers
    /// discard the snapshot on error.
    fn add_writable_memory_for_end_state(
        snapshot: &mut Snapshot,
        end_state: &EndState,
    ) -> Result<(), MakerError> {
        // The memory grown during making is the end state's bytes minus the
        // mappings the snapshot already has.
        let mut byte_set = MemoryByteSet::new();
        for memory_bytes in end_state.memory_bytes() {
            byte_set.add(memory_bytes.start_address(), memory_bytes.limit_address());
        }
        for mapping in snapshot.memory_mappings() {
            byte_set.remove(mapping.start_address(), mapping.limit_address());
        }

        let mut first_error: Option<MakerError> = None;
        for (start_address, limit_address) in byte_set.ranges() {
            let added = Self::add_data_mapping(snapshot, start_address, limit_address);
            if let Err(e) = added {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Adds one zero-initialized RW data mapping at [start_address,
    // limit_address).
    fn add_data_mapping(
        snapshot: &mut Snapshot,
        start_address: u64,
        limit_address: u64,
    ) -> Result<(), MakerError> {
        debug!("adding data mapping for [{start_address:#x}, {limit_address:#x})");

        if !is_page_aligned(start_address) || !is_page_aligned(limit_address) {
            return Err(MakerError::Internal(format!(
                "New memory bytes not page-aligned: [{start_address:#x}, {limit_address:#x})"
            )));
        }
        if reserved_memory_mappings().overlaps(start_address, limit_address) {
            return Err(MakerError::Internal(format!(
                "New memory mapping overlaps with reserved memory mappings: \
                 [{start_address:#x}, {limit_address:#x})"
            )));
        }
        MemoryMapping::can_make_ranged(start_address, limit_address)?;
        let mapping = MemoryMapping::make_ranged(start_address, limit_address, MemoryPerms::rw())?;
        snapshot.can_add_memory_mapping(&mapping)?;
        snapshot.add_memory_mapping(mapping)?;

        let zero_memory_bytes = MemoryBytes::new(
            start_address,
            vec![0u8; (limit_address - start_address) as usize],
        )?;
        snapshot.can_add_memory_bytes(&zero_memory_bytes)?;
        snapshot.add_memory_bytes(zero_memory_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{RunResult, TraceStep};
    use crate::insns::{instructions_to_snapshot_x86_64, FuzzingConfigX86_64};
    use crate::memory::MemoryBytes;
    use crate::platform::PlatformId;
    use crate::snapshot::RegisterState;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted driver: pops pre-arranged results per operation and streams
    /// pre-arranged trace steps.
    #[derive(Default)]
    struct FakeRunnerDriver {
        make_results: Mutex<VecDeque<RunResult>>,
        verify_results: Mutex<VecDeque<RunResult>>,
        trace_steps: Mutex<Vec<TraceStep>>,
        trace_result: Mutex<Option<RunResult>>,
    }

    impl FakeRunnerDriver {
        fn with_make_result(result: RunResult) -> Self {
            let driver = Self::default();
            driver.make_results.lock().unwrap().push_back(result);
            driver
        }
    }

    impl RunnerDriver for FakeRunnerDriver {
        fn make_one(
            &self,
            _snapshot: &Snapshot,
            _max_pages_to_add: u64,
        ) -> Result<RunResult, DriverError> {
            Ok(self
                .make_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(RunResult::as_expected))
        }

        fn verify_one_repeatedly(
            &self,
            _snapshot: &Snapshot,
            _num_attempts: usize,
        ) -> Result<RunResult, DriverError> {
            Ok(self
                .verify_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(RunResult::as_expected))
        }

        fn trace_one(
            &self,
            _snapshot: &Snapshot,
            step_fn: &mut dyn FnMut(&TraceStep) -> bool,
        ) -> Result<RunResult, DriverError> {
            for step in self.trace_steps.lock().unwrap().iter() {
                if !step_fn(step) {
                    return Ok(RunResult::failed(
                        PlaybackOutcome::ExecutionMisbehave,
                        None,
                    ));
                }
            }
            Ok(self
                .trace_result
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(RunResult::as_expected))
        }
    }

    fn maker_with(driver: FakeRunnerDriver) -> SnapMaker {
        let opts = SnapMakerOptions {
            runner_path: PathBuf::from("/fake/runner"),
            ..SnapMakerOptions::default()
        };
        SnapMaker::with_driver(opts, Box::new(driver)).unwrap()
    }

    fn candidate_snapshot() -> Snapshot {
        instructions_to_snapshot_x86_64(&[0x90, 0x90], &FuzzingConfigX86_64::default()).unwrap()
    }

    fn end_state_at(snapshot: &Snapshot) -> (u64, EndState) {
        let endpoint_address = snapshot.registers().unwrap().instruction_pointer() + 2;
        let end_state = EndState::new(
            Endpoint::instruction(endpoint_address),
            RegisterState::new(
                Arch::X86_64,
                endpoint_address,
                snapshot.registers().unwrap().stack_pointer(),
            ),
        );
        (endpoint_address, end_state)
    }

    #[test]
    fn options_validation() {
        assert!(matches!(
            SnapMakerOptions::default().validate(),
            Err(MakerError::InvalidArgument(_))
        ));
        let no_attempts = SnapMakerOptions {
            runner_path: PathBuf::from("/runner"),
            num_verify_attempts: 0,
            ..SnapMakerOptions::default()
        };
        assert!(matches!(
            no_attempts.validate(),
            Err(MakerError::InvalidArgument(_))
        ));
        let good = SnapMakerOptions {
            runner_path: PathBuf::from("/runner"),
            ..SnapMakerOptions::default()
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn make_requires_an_expected_end_state() {
        let maker = maker_with(FakeRunnerDriver::default());
        let mut snapshot = candidate_snapshot();
        snapshot.set_expected_end_states(Vec::new());
        assert!(matches!(
            maker.make(&snapshot),
            Err(MakerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn make_with_memory_mismatch_grows_memory_and_anchors_endpoint() {
        let snapshot = candidate_snapshot();
        let (endpoint_address, mut actual) = end_state_at(&snapshot);
        // The run touched a page the snapshot does not map.
        actual.add_memory_bytes(MemoryBytes::new(0x6000_0000, vec![0xAB; 0x1000]).unwrap());
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::MemoryMismatch,
            Some(actual),
        ));

        let made = maker_with(driver).make(&snapshot).unwrap();

        // Exactly one undefined end state at the observed endpoint.
        assert_eq!(made.expected_end_states().len(), 1);
        let end_state = &made.expected_end_states()[0];
        assert!(!end_state.is_complete());
        assert_eq!(
            *end_state.endpoint(),
            Endpoint::instruction(endpoint_address)
        );

        // The touched page became a zero-filled RW mapping.
        let grown = made
            .memory_mappings()
            .iter()
            .find(|m| m.start_address() == 0x6000_0000)
            .unwrap();
        assert_eq!(grown.perms(), MemoryPerms::rw());
        assert!(!grown.perms().has(MemoryPerms::x()));
        let grown_bytes = made
            .memory_bytes()
            .iter()
            .find(|b| b.start_address() == 0x6000_0000)
            .unwrap();
        assert!(grown_bytes.byte_values().iter().all(|&b| b == 0));

        // No negative mappings survive making.
        assert!(made.negative_memory_mappings().is_empty());
    }

    #[test]
    fn make_with_register_mismatch_is_fixable() {
        let snapshot = candidate_snapshot();
        let (endpoint_address, actual) = end_state_at(&snapshot);
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::RegisterStateMismatch,
            Some(actual),
        ));
        let made = maker_with(driver).make(&snapshot).unwrap();
        assert_eq!(made.expected_end_states().len(), 1);
        assert_eq!(
            *made.expected_end_states()[0].endpoint(),
            Endpoint::instruction(endpoint_address)
        );
    }

    fn misbehave_with(sig_num: SigNum, sig_cause: SigCause) -> RunResult {
        let endpoint = Endpoint::signal(sig_num, sig_cause, 0x6000_0000, 0x3000_0001);
        RunResult::failed(
            PlaybackOutcome::ExecutionMisbehave,
            Some(EndState::undefined_at(endpoint)),
        )
    }

    fn expect_stop_reason(result: Result<Snapshot, MakerError>, expected: MakerStopReason) {
        match result {
            Err(MakerError::SnapIncompatible { reason, .. }) => assert_eq!(reason, expected),
            other => panic!("expected SnapIncompatible({expected}), got {other:?}"),
        }
    }

    #[test]
    fn make_classifies_sigtrap() {
        let driver = FakeRunnerDriver::with_make_result(misbehave_with(
            SigNum::SigTrap,
            SigCause::GenericSigCause,
        ));
        expect_stop_reason(
            maker_with(driver).make(&candidate_snapshot()),
            MakerStopReason::SigTrap,
        );
    }

    #[test]
    fn make_classifies_unfixable_rw_segv() {
        for cause in [SigCause::SegvCantRead, SigCause::SegvCantWrite] {
            let driver =
                FakeRunnerDriver::with_make_result(misbehave_with(SigNum::SigSegv, cause));
            expect_stop_reason(
                maker_with(driver).make(&candidate_snapshot()),
                MakerStopReason::CannotAddMemory,
            );
        }
    }

    #[test]
    fn make_classifies_general_protection_segv() {
        let driver = FakeRunnerDriver::with_make_result(misbehave_with(
            SigNum::SigSegv,
            SigCause::SegvGeneralProtection,
        ));
        expect_stop_reason(
            maker_with(driver).make(&candidate_snapshot()),
            MakerStopReason::GeneralProtectionSigSegv,
        );
    }

    #[test]
    fn make_classifies_hard_segv() {
        for cause in [
            SigCause::SegvCantExec,
            SigCause::SegvOverflow,
            SigCause::GenericSigCause,
        ] {
            let driver =
                FakeRunnerDriver::with_make_result(misbehave_with(SigNum::SigSegv, cause));
            expect_stop_reason(
                maker_with(driver).make(&candidate_snapshot()),
                MakerStopReason::HardSigSegv,
            );
        }
    }

    #[test]
    fn make_classifies_other_signals() {
        let driver = FakeRunnerDriver::with_make_result(misbehave_with(
            SigNum::SigFpe,
            SigCause::GenericSigCause,
        ));
        let result = maker_with(driver).make(&candidate_snapshot());
        match result {
            Err(MakerError::SnapIncompatible { reason, details }) => {
                assert_eq!(reason, MakerStopReason::Signal);
                assert!(details.contains("SIGFPE"));
            }
            other => panic!("expected SnapIncompatible(Signal), got {other:?}"),
        }
    }

    #[test]
    fn make_classifies_runaway() {
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::ExecutionRunaway,
            Some(EndState::undefined(0x3000_0000)),
        ));
        expect_stop_reason(
            maker_with(driver).make(&candidate_snapshot()),
            MakerStopReason::TimeBudget,
        );
    }

    #[test]
    fn make_rejects_successful_run_with_undefined_end_state() {
        let driver = FakeRunnerDriver::with_make_result(RunResult::as_expected());
        let result = maker_with(driver).make(&candidate_snapshot());
        match result {
            Err(MakerError::Internal(message)) => assert!(message.contains("Unlikely")),
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn make_rejects_contradictory_as_expected_failure() {
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::AsExpected,
            None,
        ));
        let result = maker_with(driver).make(&candidate_snapshot());
        match result {
            Err(MakerError::Internal(message)) => assert!(message.contains("Impossible")),
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn make_rejects_unsupported_outcomes() {
        for outcome in [
            PlaybackOutcome::EndpointMismatch,
            PlaybackOutcome::PlatformMismatch,
        ] {
            let driver = FakeRunnerDriver::with_make_result(RunResult::failed(outcome, None));
            let result = maker_with(driver).make(&candidate_snapshot());
            match result {
                Err(MakerError::Internal(message)) => assert!(message.contains("Unsupported")),
                other => panic!("expected Internal, got {other:?}"),
            }
        }
    }

    #[test]
    fn make_rejects_missing_actual_end_state() {
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::MemoryMismatch,
            None,
        ));
        let result = maker_with(driver).make(&candidate_snapshot());
        assert!(matches!(result, Err(MakerError::Internal(_))));
    }

    #[test]
    fn grown_memory_must_be_page_aligned() {
        let snapshot = candidate_snapshot();
        let (_, mut actual) = end_state_at(&snapshot);
        actual.add_memory_bytes(MemoryBytes::new(0x6000_0010, vec![1; 0x20]).unwrap());
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::MemoryMismatch,
            Some(actual),
        ));
        let result = maker_with(driver).make(&snapshot);
        assert!(matches!(result, Err(MakerError::Internal(_))));
    }

    #[test]
    fn grown_memory_must_avoid_reserved_regions() {
        let snapshot = candidate_snapshot();
        let (_, mut actual) = end_state_at(&snapshot);
        // Page zero is inside the reserved null guard.
        actual.add_memory_bytes(MemoryBytes::new(0, vec![1; 0x1000]).unwrap());
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::MemoryMismatch,
            Some(actual),
        ));
        let result = maker_with(driver).make(&snapshot);
        assert!(matches!(result, Err(MakerError::Internal(_))));
    }

    #[test]
    fn record_end_state_stamps_platform_and_completes() {
        let snapshot = candidate_snapshot();
        let (_, actual) = end_state_at(&snapshot);
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::RegisterStateMismatch,
            Some(actual),
        ));
        let recorded = maker_with(driver).record_end_state(&snapshot).unwrap();
        assert_eq!(recorded.expected_end_states().len(), 1);
        let end_state = &recorded.expected_end_states()[0];
        assert!(end_state.is_complete());
        assert_eq!(end_state.platforms(), &[current_platform_id()]);
        assert!(recorded.is_complete(Completeness::Complete).is_ok());
        assert_ne!(end_state.platforms()[0], PlatformId::Undefined);
    }

    #[test]
    fn record_end_state_adds_negative_mappings_for_signal_end_states() {
        let snapshot = candidate_snapshot();
        let sig_end_state = EndState::new(
            Endpoint::signal(
                SigNum::SigSegv,
                SigCause::SegvCantWrite,
                0x6000_0123,
                snapshot.registers().unwrap().instruction_pointer(),
            ),
            RegisterState::new(
                Arch::X86_64,
                snapshot.registers().unwrap().instruction_pointer(),
                snapshot.registers().unwrap().stack_pointer(),
            ),
        );
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::ExecutionMisbehave,
            Some(sig_end_state),
        ));
        let recorded = maker_with(driver).record_end_state(&snapshot).unwrap();
        assert_eq!(recorded.negative_memory_mappings().len(), 1);
        assert_eq!(
            recorded.negative_memory_mappings()[0].start_address(),
            0x6000_0000
        );
    }

    #[test]
    fn record_end_state_requires_actual_end_state_on_failure() {
        let snapshot = candidate_snapshot();
        let driver = FakeRunnerDriver::with_make_result(RunResult::failed(
            PlaybackOutcome::RegisterStateMismatch,
            None,
        ));
        let result = maker_with(driver).record_end_state(&snapshot);
        assert!(matches!(result, Err(MakerError::Internal(_))));
    }

    #[test]
    fn record_end_state_passes_through_already_complete_snapshots() {
        let mut snapshot = candidate_snapshot();
        let (_, complete) = end_state_at(&snapshot);
        snapshot.set_expected_end_states(vec![complete]);
        // Successful run: the snapshot is already fully recorded.
        let driver = FakeRunnerDriver::with_make_result(RunResult::as_expected());
        let recorded = maker_with(driver).record_end_state(&snapshot).unwrap();
        assert!(recorded.is_complete(Completeness::Complete).is_ok());
    }

    #[test]
    fn verify_succeeds_on_deterministic_replay() {
        let mut snapshot = candidate_snapshot();
        let (_, complete) = end_state_at(&snapshot);
        snapshot.set_expected_end_states(vec![complete]);
        let maker = maker_with(FakeRunnerDriver::default());
        assert!(maker.verify_plays_deterministically(&snapshot).is_ok());
    }

    #[test]
    fn verify_fails_on_nondeterministic_replay() {
        let mut snapshot = candidate_snapshot();
        let (_, complete) = end_state_at(&snapshot);
        snapshot.set_expected_end_states(vec![complete.clone()]);
        let driver = FakeRunnerDriver::default();
        driver
            .verify_results
            .lock()
            .unwrap()
            .push_back(RunResult::failed(
                PlaybackOutcome::RegisterStateMismatch,
                Some(complete),
            ));
        let result = maker_with(driver).verify_plays_deterministically(&snapshot);
        match result {
            Err(MakerError::Internal(message)) => {
                assert!(message.contains("non-deterministic"))
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_undefined_end_states() {
        // The lifted snapshot still has its undefined end state; run opts
        // must refuse it before the driver is even consulted.
        let snapshot = candidate_snapshot();
        let maker = maker_with(FakeRunnerDriver::default());
        assert!(matches!(
            maker.verify_plays_deterministically(&snapshot),
            Err(MakerError::Snapshot(_))
        ));
    }

    #[test]
    fn check_trace_records_disassembly() {
        let snapshot = candidate_snapshot();
        let code = snapshot.registers().unwrap().instruction_pointer();
        let driver = FakeRunnerDriver::default();
        *driver.trace_steps.lock().unwrap() = vec![
            TraceStep {
                address: code,
                instruction_bytes: vec![0x90],
                memory_access: None,
            },
            TraceStep {
                address: code + 1,
                instruction_bytes: vec![0x90],
                memory_access: None,
            },
        ];
        let traced = maker_with(driver)
            .check_trace(&snapshot, &TraceOptions::default())
            .unwrap();
        assert_eq!(traced.trace_data().len(), 1);
        let trace_data = &traced.trace_data()[0];
        assert_eq!(trace_data.num_instructions(), 2);
        assert_eq!(trace_data.disassembly().lines().count(), 2);
        assert_eq!(trace_data.platforms(), &[current_platform_id()]);
    }

    #[test]
    fn check_trace_fails_on_banned_instruction() {
        let snapshot = candidate_snapshot();
        let code = snapshot.registers().unwrap().instruction_pointer();
        let driver = FakeRunnerDriver::default();
        *driver.trace_steps.lock().unwrap() = vec![TraceStep {
            address: code,
            instruction_bytes: vec![0x0F, 0x31],
            memory_access: None,
        }];
        let result = maker_with(driver).check_trace(&snapshot, &TraceOptions::default());
        match result {
            Err(MakerError::Internal(message)) => {
                assert!(message.contains("Tracing failed"));
                assert!(message.contains("rdtsc"));
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn check_trace_is_identity_on_aarch64() {
        use crate::insns::{instructions_to_snapshot_aarch64, FuzzingConfigAArch64};
        let snapshot = instructions_to_snapshot_aarch64(
            &[0x1f, 0x20, 0x03, 0xd5],
            &FuzzingConfigAArch64::default(),
        )
        .unwrap();
        let maker = maker_with(FakeRunnerDriver::default());
        let traced = maker.check_trace(&snapshot, &TraceOptions::default()).unwrap();
        assert_eq!(traced, snapshot);
    }
}
