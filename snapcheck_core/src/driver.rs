use crate::snapshot::{EndState, Snapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Errors raised while driving the external runner.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The runner binary does not exist at the configured path.
    #[error("runner binary {0:?} not found")]
    RunnerNotFound(PathBuf),

    /// The runner process could not be launched.
    #[error("failed to launch runner: {0}")]
    Spawn(String),

    /// An I/O error while talking to the runner process.
    #[error("runner I/O error: {0}")]
    Io(String),

    /// The runner produced output that does not parse as a result report.
    #[error("runner produced a malformed report: {0}")]
    MalformedReport(String),

    /// The runner exited without reporting a result.
    #[error("runner exited abnormally: {0}")]
    Abnormal(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// How a single play of a snapshot ended, as classified by the runner.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum PlaybackOutcome {
    /// Execution reached the expected end state exactly.
    AsExpected,
    /// Execution reached the expected endpoint but the memory differed.
    MemoryMismatch,
    /// Execution reached the expected endpoint but the registers differed.
    RegisterStateMismatch,
    /// Execution stopped on an unexpected signal.
    ExecutionMisbehave,
    /// Execution exceeded its time budget.
    ExecutionRunaway,
    /// Execution stopped at a different endpoint than expected.
    EndpointMismatch,
    /// The snapshot's end states are for a different platform.
    PlatformMismatch,
}

/// The per-play detail of a [`RunResult`]. `actual_end_state` is present
/// whenever the play did not end as expected and the runner could observe
/// where it did end.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PlayerResult {
    pub outcome: PlaybackOutcome,
    pub actual_end_state: Option<EndState>,
}

/// The runner's verdict for one driver operation.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RunResult {
    success: bool,
    player_result: PlayerResult,
}

impl RunResult {
    pub fn new(success: bool, player_result: PlayerResult) -> Self {
        Self {
            success,
            player_result,
        }
    }

    /// A successful result with the `AsExpected` outcome.
    pub fn as_expected() -> Self {
        Self::new(
            true,
            PlayerResult {
                outcome: PlaybackOutcome::AsExpected,
                actual_end_state: None,
            },
        )
    }

    /// An unsuccessful result with the given outcome and observed end state.
    pub fn failed(outcome: PlaybackOutcome, actual_end_state: Option<EndState>) -> Self {
        Self::new(
            false,
            PlayerResult {
                outcome,
                actual_end_state,
            },
        )
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn player_result(&self) -> &PlayerResult {
        &self.player_result
    }
}

/// A memory operand observed while single-stepping.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MemoryAccess {
    pub address: u64,
    pub num_bytes: u64,
}

/// One single-stepped instruction reported by the runner in trace mode.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TraceStep {
    /// Address the instruction was fetched from.
    pub address: u64,
    /// Raw encoding of the instruction.
    pub instruction_bytes: Vec<u8>,
    /// The memory operand, when the instruction has one and the runner
    /// reports it (locked x86 accesses always do).
    pub memory_access: Option<MemoryAccess>,
}

/// A line of the runner's stdout protocol: zero or more `Step` lines while
/// tracing, terminated by exactly one `Result` line.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum RunnerMessage {
    Step(TraceStep),
    Result(RunResult),
}

/// Contract for submitting a snapshot to an external executor.
///
/// All three operations block for the duration of the runner subprocess and
/// guarantee the subprocess is reaped on every exit path. Implementations
/// must be safe to share between threads; concurrent calls operate on
/// disjoint subprocesses.
pub trait RunnerDriver: Send + Sync {
    /// Plays the snapshot once in make mode. The runner may grow up to
    /// `max_pages_to_add` pages to repair recoverable faults before giving
    /// up.
    fn make_one(&self, snapshot: &Snapshot, max_pages_to_add: u64)
        -> Result<RunResult, DriverError>;

    /// Replays the snapshot `num_attempts` times; succeeds iff every replay
    /// reaches the recorded end state bit-exactly.
    fn verify_one_repeatedly(
        &self,
        snapshot: &Snapshot,
        num_attempts: usize,
    ) -> Result<RunResult, DriverError>;

    /// Single-steps the snapshot, invoking `step_fn` per instruction. If
    /// `step_fn` returns false the runner is stopped and the result reports
    /// an unsuccessful play.
    fn trace_one(
        &self,
        snapshot: &Snapshot,
        step_fn: &mut dyn FnMut(&TraceStep) -> bool,
    ) -> Result<RunResult, DriverError>;
}

// Snapshot file handed to the runner; removed when the call finishes.
struct TempSnapshotFile {
    path: PathBuf,
}

impl TempSnapshotFile {
    fn create(snapshot: &Snapshot) -> Result<Self, DriverError> {
        let path = std::env::temp_dir().join(format!(
            "snapcheck-{}-{}.snap",
            std::process::id(),
            snapshot.id()
        ));
        snapshot.write_to_file(&path)?;
        Ok(Self { path })
    }
}

impl Drop for TempSnapshotFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Drives the runner binary as a subprocess.
///
/// The snapshot travels as a file; the runner reports `RunnerMessage` JSON
/// lines on stdout. Stderr is captured and surfaced in errors.
pub struct CommandRunnerDriver {
    runner_path: PathBuf,
}

impl CommandRunnerDriver {
    pub fn new(runner_path: impl Into<PathBuf>) -> Result<Self, DriverError> {
        let runner_path = runner_path.into();
        if !runner_path.is_file() {
            return Err(DriverError::RunnerNotFound(runner_path));
        }
        Ok(Self { runner_path })
    }

    pub fn runner_path(&self) -> &Path {
        &self.runner_path
    }

    fn run_runner(
        &self,
        snapshot: &Snapshot,
        subcommand: &str,
        extra_args: &[String],
        mut step_fn: Option<&mut dyn FnMut(&TraceStep) -> bool>,
    ) -> Result<RunResult, DriverError> {
        let snapshot_file = TempSnapshotFile::create(snapshot)?;
        debug!(
            runner = ?self.runner_path,
            subcommand,
            snap_id = snapshot.id(),
            "invoking runner"
        );
        let mut child = Command::new(&self.runner_path)
            .arg(subcommand)
            .arg("--snapshot")
            .arg(&snapshot_file.path)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::Spawn(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Read the protocol inside a closure so the child is reaped on every
        // exit path below.
        let mut stopped_early = false;
        let read_outcome = (|| -> Result<Option<RunResult>, DriverError> {
            let stdout = stdout.ok_or_else(|| DriverError::Io("runner stdout missing".into()))?;
            let reader = BufReader::new(stdout);
            let mut final_result = None;
            for line in reader.lines() {
                let line = line.map_err(|e| DriverError::Io(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                let message: RunnerMessage = serde_json::from_str(&line)
                    .map_err(|e| DriverError::MalformedReport(format!("{e}: {line}")))?;
                match message {
                    RunnerMessage::Step(step) => {
                        if let Some(on_step) = step_fn.as_deref_mut() {
                            if !on_step(&step) {
                                stopped_early = true;
                                return Ok(None);
                            }
                        }
                    }
                    RunnerMessage::Result(result) => {
                        final_result = Some(result);
                    }
                }
            }
            Ok(final_result)
        })();

        let _ = child.kill();
        let wait_status = child.wait();
        drop(snapshot_file);

        let mut stderr_text = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut stderr_text);
        }

        let status = wait_status.map_err(|e| DriverError::Io(e.to_string()))?;
        match read_outcome? {
            Some(result) => Ok(result),
            None if stopped_early => {
                // The tracer cut the run short; report an unsuccessful play.
                Ok(RunResult::failed(PlaybackOutcome::ExecutionMisbehave, None))
            }
            None => Err(DriverError::Abnormal(format!(
                "runner exited with {status} without reporting a result: {}",
                stderr_text.trim()
            ))),
        }
    }
}

impl RunnerDriver for CommandRunnerDriver {
    fn make_one(
        &self,
        snapshot: &Snapshot,
        max_pages_to_add: u64,
    ) -> Result<RunResult, DriverError> {
        self.run_runner(
            snapshot,
            "make",
            &[format!("--max-pages-to-add={max_pages_to_add}")],
            None,
        )
    }

    fn verify_one_repeatedly(
        &self,
        snapshot: &Snapshot,
        num_attempts: usize,
    ) -> Result<RunResult, DriverError> {
        self.run_runner(
            snapshot,
            "verify",
            &[format!("--num-attempts={num_attempts}")],
            None,
        )
    }

    fn trace_one(
        &self,
        snapshot: &Snapshot,
        step_fn: &mut dyn FnMut(&TraceStep) -> bool,
    ) -> Result<RunResult, DriverError> {
        self.run_runner(snapshot, "trace", &[], Some(step_fn))
    }
}
