use crate::engine::resolve_strategies;
use crate::executor::HarnessConfig;
use crate::fuzz::FuzzOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    /// Seed for the session's generator. Drawn from OS entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_min_mutations")]
    pub min_mutations: usize,
    #[serde(default = "default_max_mutations")]
    pub max_mutations: usize,
    /// Strategy names to draw from; every strategy when absent.
    #[serde(default)]
    pub strategies: Option<Vec<String>>,
}

pub fn default_iterations() -> u64 {
    100
}
pub fn default_threads() -> usize {
    1
}
fn default_min_mutations() -> usize {
    crate::fuzz::DEFAULT_MIN_MUTATIONS
}
fn default_max_mutations() -> usize {
    crate::fuzz::DEFAULT_MAX_MUTATIONS
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: None,
            threads: default_threads(),
            min_mutations: default_min_mutations(),
            max_mutations: default_max_mutations(),
            strategies: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    /// Program plus leading arguments; the mutated file path is appended last.
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub working_dir: Option<PathBuf>,
    /// Where mutated inputs are staged; the system temp directory when absent.
    pub temp_dir: Option<PathBuf>,
}

pub fn default_timeout_secs() -> u64 {
    2
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,
    #[serde(default = "default_cases_dir")]
    pub cases_dir: PathBuf,
}

pub fn default_crash_dir() -> PathBuf {
    PathBuf::from("crashes")
}

pub fn default_cases_dir() -> PathBuf {
    PathBuf::from("glitch_cases")
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            crash_dir: default_crash_dir(),
            cases_dir: default_cases_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GlitchConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub harness: Option<HarnessSettings>,
    #[serde(default)]
    pub output: OutputSettings,
}

impl GlitchConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: GlitchConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the settings a run depends on. CLI overrides should be applied first.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let fuzzer = &self.fuzzer;
        if fuzzer.iterations == 0 {
            anyhow::bail!("fuzzer.iterations must be positive");
        }
        if fuzzer.threads == 0 {
            anyhow::bail!("fuzzer.threads must be positive");
        }
        if fuzzer.min_mutations == 0 {
            anyhow::bail!("fuzzer.min-mutations must be positive");
        }
        if fuzzer.min_mutations > fuzzer.max_mutations {
            anyhow::bail!(
                "fuzzer.min-mutations ({}) exceeds fuzzer.max-mutations ({})",
                fuzzer.min_mutations,
                fuzzer.max_mutations
            );
        }
        if let Some(names) = &fuzzer.strategies {
            resolve_strategies(names.as_slice())?;
        }
        if let Some(harness) = &self.harness {
            if harness.command.is_empty() {
                anyhow::bail!("harness.command must name a program");
            }
            if harness.timeout_secs == 0 {
                anyhow::bail!("harness.timeout-secs must be positive");
            }
        }
        Ok(())
    }

    /// Fuzz loop parameters; crashes go to `output.crash-dir`.
    pub fn to_fuzz_options(&self) -> Result<FuzzOptions, anyhow::Error> {
        let strategies = self
            .fuzzer
            .strategies
            .as_deref()
            .map(resolve_strategies)
            .transpose()?;
        Ok(FuzzOptions {
            iterations: self.fuzzer.iterations,
            min_mutations: self.fuzzer.min_mutations,
            max_mutations: self.fuzzer.max_mutations,
            strategies,
            crash_dir: Some(self.output.crash_dir.clone()),
        })
    }

    /// `None` when no `[harness]` table is configured.
    pub fn to_harness_config(&self) -> Option<HarnessConfig> {
        self.harness.as_ref().map(|harness| HarnessConfig {
            command: harness.command.clone(),
            timeout: Duration::from_secs(harness.timeout_secs),
            working_dir: harness.working_dir.clone(),
            temp_dir: harness.temp_dir.clone(),
        })
    }
}
