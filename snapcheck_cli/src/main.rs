use snapcheck_core::config::{FixToolConfig, TraceSettings};
use snapcheck_core::insns::{
    instructions_to_snapshot_aarch64, instructions_to_snapshot_x86_64, FuzzingConfigAArch64,
    FuzzingConfigX86_64,
};
use snapcheck_core::{Arch, RelocatedCorpus, SnapMaker, Snapshot};

use anyhow::Context;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Converts raw instruction blobs into a runnable Snap corpus.
///
/// Each input file is one candidate instruction sequence. Candidates are
/// lifted into snapshots, repaired and recorded by the maker, checked for
/// determinism and trace cleanliness, and the survivors are written out as
/// one relocatable corpus file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (see FixToolConfig).
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// Overrides the configured runner binary path.
    #[clap(long)]
    runner: Option<PathBuf>,

    /// Overrides the configured corpus output path.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Candidate instruction blob files.
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
}

fn lift(bytes: &[u8]) -> Result<Snapshot, snapcheck_core::LiftError> {
    match Arch::current() {
        Arch::X86_64 => instructions_to_snapshot_x86_64(bytes, &FuzzingConfigX86_64::default()),
        Arch::AArch64 => instructions_to_snapshot_aarch64(bytes, &FuzzingConfigAArch64::default()),
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("loading configuration from {config_path:?}");
            FixToolConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("snapcheck.toml");
            if default_config_path.exists() {
                info!("loading default configuration from {default_config_path:?}");
                FixToolConfig::load_from_file(&default_config_path)?
            } else {
                anyhow::bail!(
                    "no config file given and default 'snapcheck.toml' not found; \
                     pass --config-file"
                );
            }
        }
    };

    if let Some(runner) = cli.runner {
        config.maker.runner_path = runner;
    }
    let output_path = cli
        .output
        .or_else(|| config.corpus.as_ref().map(|c| c.output_path.clone()))
        .context("no corpus output path; pass --output or set [corpus] output-path")?;

    let trace_options = config
        .trace
        .clone()
        .unwrap_or_else(TraceSettings::default)
        .to_options();
    let maker = SnapMaker::new(config.maker.to_options())
        .map_err(|e| anyhow::anyhow!("cannot construct maker: {e}"))?;

    let mut counters: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut bump = |counters: &mut BTreeMap<&'static str, u64>, name: &'static str| {
        *counters.entry(name).or_insert(0) += 1;
    };

    let mut corpus_members: Vec<Snapshot> = Vec::new();
    for input in &cli.inputs {
        bump(&mut counters, "inputs");
        let bytes = match std::fs::read(input) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("skipping unreadable input {input:?}: {e}");
                bump(&mut counters, "unreadable-inputs");
                continue;
            }
        };

        let lifted = match lift(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                info!("rejected {input:?} at lifting: {e}");
                bump(&mut counters, "rejected-lift");
                continue;
            }
        };

        let made = match maker.make(&lifted) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                info!("rejected {} at make: {e}", lifted.id());
                bump(&mut counters, "rejected-make");
                continue;
            }
        };

        let recorded = match maker.record_end_state(&made) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                info!("rejected {} at record: {e}", made.id());
                bump(&mut counters, "rejected-record");
                continue;
            }
        };

        if let Err(e) = maker.verify_plays_deterministically(&recorded) {
            info!("rejected {} at verify: {e}", recorded.id());
            bump(&mut counters, "rejected-verify");
            continue;
        }

        let traced = match maker.check_trace(&recorded, &trace_options) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                info!("rejected {} at trace: {e}", recorded.id());
                bump(&mut counters, "rejected-trace");
                continue;
            }
        };

        bump(&mut counters, "made");
        corpus_members.push(traced);
    }

    info!(
        "writing {} snapshots to corpus {output_path:?}",
        corpus_members.len()
    );
    snapcheck_core::write_corpus_file(&corpus_members, &output_path)
        .map_err(|e| anyhow::anyhow!("failed to write corpus: {e}"))?;

    // Self-check: the corpus we just wrote must relocate cleanly.
    let relocated = RelocatedCorpus::load(&output_path)
        .map_err(|e| anyhow::anyhow!("freshly written corpus fails to relocate: {e}"))?;
    info!(
        "corpus {output_path:?} relocates cleanly: {} snaps, {} bytes",
        relocated.num_snaps(),
        relocated.byte_len()
    );

    // Dump counters, sorted by name.
    for (name, value) in &counters {
        println!("{name} {value}");
    }

    Ok(())
}
