use crate::maker::SnapMakerOptions;
use crate::tracer::TraceOptions;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MakerSettings {
    pub runner_path: PathBuf,
    #[serde(default = "default_max_pages_to_add")]
    pub max_pages_to_add: u64,
    #[serde(default = "default_num_verify_attempts")]
    pub num_verify_attempts: usize,
}

pub fn default_max_pages_to_add() -> u64 {
    5
}
pub fn default_num_verify_attempts() -> usize {
    5
}

impl MakerSettings {
    pub fn to_options(&self) -> SnapMakerOptions {
        SnapMakerOptions {
            runner_path: self.runner_path.clone(),
            max_pages_to_add: self.max_pages_to_add,
            num_verify_attempts: self.num_verify_attempts,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TraceSettings {
    #[serde(default = "default_true")]
    pub filter_banned_instructions: bool,
    #[serde(default = "default_true")]
    pub x86_filter_split_lock: bool,
    #[serde(default = "default_instruction_count_budget")]
    pub instruction_count_budget: u64,
}

fn default_true() -> bool {
    true
}
fn default_instruction_count_budget() -> u64 {
    1000
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            filter_banned_instructions: true,
            x86_filter_split_lock: true,
            instruction_count_budget: default_instruction_count_budget(),
        }
    }
}

impl TraceSettings {
    pub fn to_options(&self) -> TraceOptions {
        TraceOptions {
            filter_banned_instructions: self.filter_banned_instructions,
            x86_filter_split_lock: self.x86_filter_split_lock,
            instruction_count_budget: self.instruction_count_budget,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    pub output_path: PathBuf,
}

/// Top-level configuration of the fix tool pipeline.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FixToolConfig {
    pub maker: MakerSettings,
    pub trace: Option<TraceSettings>,
    pub corpus: Option<CorpusSettings>,
}

impl FixToolConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FixToolConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
