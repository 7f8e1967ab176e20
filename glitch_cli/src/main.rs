use glitch_core::config::{GlitchConfig, HarnessSettings};
use glitch_core::diff::analyze;
use glitch_core::engine::{GlitchEngine, resolve_strategies};
use glitch_core::executor::ProcessHarness;
use glitch_core::fuzz::{FuzzReport, StopToken, fuzz_parallel};
use glitch_core::mutator::Strategy;

use clap::{Parser, Subcommand};
use log::info;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Number of crashes and byte differences listed in human-readable output.
const LISTING_LIMIT: usize = 10;
const DEFAULT_CONFIG_FILE: &str = "glitch.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Mutation-based input corruption and fuzzing", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults to ./glitch.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log every applied mutation.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Seed for reproducible runs.
    #[arg(long, global = true)]
    seed: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Glitch a single file
    File {
        input: PathBuf,
        #[arg(short = 'n', long, default_value_t = 1)]
        mutations: usize,
        /// Defaults to <stem>_glitched.<ext> next to the input.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, num_args = 1..)]
        strategies: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Generate multiple test cases from a template
    Generate {
        template: PathBuf,
        #[arg(short, long, default_value_t = 10)]
        count: usize,
        #[arg(short = 'n', long, default_value_t = 3)]
        mutations: usize,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(short, long, num_args = 1..)]
        strategies: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Fuzz a binary, passing each mutated input as a file path
    Fuzz {
        binary: String,
        template: PathBuf,
        #[arg(short, long)]
        iterations: Option<u64>,
        /// Per-execution timeout in seconds.
        #[arg(short, long)]
        timeout: Option<u64>,
        #[arg(short, long)]
        crash_dir: Option<PathBuf>,
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        /// Stop after this many seconds.
        #[arg(long)]
        max_time: Option<u64>,
        #[arg(short, long, num_args = 1..)]
        strategies: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Compare an original file with a glitched one
    Analyze { original: PathBuf, glitched: PathBuf },
}

fn load_config(path: Option<&Path>) -> Result<GlitchConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            GlitchConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("Loading default configuration: {default_config_path:?}");
                GlitchConfig::load_from_file(&default_config_path)
            } else {
                Ok(GlitchConfig::default())
            }
        }
    }
}

fn strategy_filter(names: &[String]) -> Result<Option<Vec<Strategy>>, anyhow::Error> {
    if names.is_empty() {
        return Ok(None);
    }
    Ok(Some(resolve_strategies(names)?))
}

fn read_input(path: &Path) -> Result<Vec<u8>, anyhow::Error> {
    std::fs::read(path).map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))
}

fn print_fuzz_report(report: &FuzzReport, crash_dir: &Path, elapsed: Duration) {
    println!("\n=== FUZZING COMPLETE ===");
    println!("Iterations: {}", report.iterations);
    if report.cancelled {
        println!("Stopped early after {elapsed:.2?}");
    }
    println!("Interesting cases: {}", report.results.len());

    if !report.results.is_empty() {
        println!("\nCrashes found:");
        for result in report.results.iter().take(LISTING_LIMIT) {
            println!(
                "  * {}: {} mutations",
                result.output_hash,
                result.mutation_count()
            );
            if let Some(info) = &result.crash_info {
                println!("    Info: {info}");
            }
        }
    }
    println!(
        "\nCrash cases saved to: {} ({} new)",
        crash_dir.display(),
        report.crash_files.len()
    );
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = Some(seed);
    }
    let seed = config.fuzzer.seed.unwrap_or_else(rand::random);
    info!("Using seed {seed}");
    let mut engine = GlitchEngine::new(ChaCha8Rng::seed_from_u64(seed));

    match cli.command {
        Command::File {
            input,
            mutations,
            output,
            strategies,
            json,
        } => {
            let strategies = strategy_filter(&strategies)?;
            info!("Glitching {input:?}...");
            let (output_path, result) = engine.glitch_file(
                &input,
                output.as_deref(),
                mutations,
                strategies.as_deref(),
            )?;

            if json {
                let value = serde_json::json!({ "output": output_path, "result": result });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Glitch complete: {}", output_path.display());
                println!("  Input hash:  {}", result.input_hash);
                println!("  Output hash: {}", result.output_hash);
                println!("  Mutations:   {}", result.mutation_count());
                for m in &result.mutations {
                    println!("    * {}: {}", m.strategy, m.description);
                }
            }
        }
        Command::Generate {
            template,
            count,
            mutations,
            output_dir,
            strategies,
            json,
        } => {
            let strategies = strategy_filter(&strategies)?;
            let output_dir = output_dir.unwrap_or(config.output.cases_dir);
            let data = read_input(&template)?;
            info!("Generating {count} test cases...");
            let cases = engine.generate_cases(
                &data,
                count,
                mutations,
                strategies.as_deref(),
                &output_dir,
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&cases)?);
            } else {
                println!(
                    "Generated {} test cases in {}",
                    cases.len(),
                    output_dir.display()
                );
            }
        }
        Command::Fuzz {
            binary,
            template,
            iterations,
            timeout,
            crash_dir,
            threads,
            max_time,
            strategies,
            json,
        } => {
            if let Some(iterations) = iterations {
                config.fuzzer.iterations = iterations;
            }
            if let Some(threads) = threads {
                config.fuzzer.threads = threads;
            }
            if let Some(crash_dir) = crash_dir {
                config.output.crash_dir = crash_dir;
            }
            if !strategies.is_empty() {
                config.fuzzer.strategies = Some(strategies);
            }
            let harness_settings = config
                .harness
                .get_or_insert_with(|| HarnessSettings {
                    timeout_secs: glitch_core::config::default_timeout_secs(),
                    ..HarnessSettings::default()
                });
            if harness_settings.command.is_empty() {
                harness_settings.command.push(binary);
            } else {
                harness_settings.command[0] = binary;
            }
            if let Some(timeout) = timeout {
                harness_settings.timeout_secs = timeout;
            }
            config.validate()?;

            let options = config.to_fuzz_options()?;
            let harness_config = config
                .to_harness_config()
                .ok_or_else(|| anyhow::anyhow!("Harness settings missing for fuzz command"))?;
            let harness = ProcessHarness::new(harness_config)?;
            let data = read_input(&template)?;

            let stop = StopToken::new();
            if let Some(secs) = max_time {
                let timer = stop.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_secs(secs));
                    timer.stop();
                });
            }

            info!(
                "Fuzzing {} with {} iterations on {} thread(s)...",
                harness.config().command.join(" "),
                options.iterations,
                config.fuzzer.threads
            );
            let start_time = Instant::now();
            let report = if config.fuzzer.threads > 1 {
                fuzz_parallel(
                    &data,
                    &options,
                    config.fuzzer.threads,
                    seed,
                    Some(&harness),
                    Some(&stop),
                )?
            } else {
                engine.test_binary(&harness, &data, &options, Some(&stop))?
            };
            let elapsed = start_time.elapsed();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_fuzz_report(&report, &config.output.crash_dir, elapsed);
            }
        }
        Command::Analyze { original, glitched } => {
            let original = read_input(&original)?;
            let glitched = read_input(&glitched)?;
            let diff = analyze(&original, &glitched);

            println!("=== GLITCH ANALYSIS ===");
            println!("Original size:  {} bytes", diff.original_len);
            println!("Glitched size:  {} bytes", diff.glitched_len);
            println!("Size delta:     {:+} bytes", diff.size_delta());
            println!("\nByte differences: {}", diff.differences.len());
            if !diff.differences.is_empty() {
                println!("\nFirst {LISTING_LIMIT} differences:");
                for d in diff.differences.iter().take(LISTING_LIMIT) {
                    println!(
                        "  0x{:08x}: 0x{:02x} -> 0x{:02x}",
                        d.offset, d.original, d.glitched
                    );
                }
            }
        }
    }

    Ok(())
}
