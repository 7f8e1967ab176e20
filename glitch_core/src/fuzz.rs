use crate::corpus::{self, CorpusError, CrashCorpus, Stored};
use crate::engine::{GlitchEngine, GlitchError, GlitchResult};
use crate::executor::ProcessHarness;
use crate::mutator::Strategy;
use crate::oracle::{CrashOracle, CrashVerdict};
use log::{info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thiserror::Error;

/// Progress is logged every this many iterations.
const PROGRESS_INTERVAL: u64 = 100;

/// Default range for the number of mutations applied per iteration.
pub const DEFAULT_MIN_MUTATIONS: usize = 1;
pub const DEFAULT_MAX_MUTATIONS: usize = 5;

#[derive(Error, Debug)]
pub enum FuzzError {
    /// Rejected before the first iteration.
    #[error("Invalid fuzzing configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Glitch(#[from] GlitchError),

    /// An interesting case could not be recorded. Distinct from a crash of the target.
    #[error("Failed to persist case: {0}")]
    CrashPersist(#[from] CorpusError),

    /// The oracle can no longer run.
    #[error("Crash oracle failed fatally: {0}")]
    OracleFatal(String),

    #[error("Fuzzing worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Cooperative cancellation flag, checked at the top of every iteration.
///
/// Clones share the same flag. An iteration already in progress always finishes, so
/// its child process and temp file are released before the loop stops.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters of one fuzzing session.
#[derive(Debug, Clone)]
pub struct FuzzOptions {
    pub iterations: u64,
    /// Each iteration applies a uniformly chosen number of mutations in this range.
    pub min_mutations: usize,
    pub max_mutations: usize,
    /// Restricts strategy selection; `None` uses every strategy.
    pub strategies: Option<Vec<Strategy>>,
    /// Where interesting inputs are persisted, if anywhere.
    pub crash_dir: Option<PathBuf>,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        Self {
            iterations: 100,
            min_mutations: DEFAULT_MIN_MUTATIONS,
            max_mutations: DEFAULT_MAX_MUTATIONS,
            strategies: None,
            crash_dir: None,
        }
    }
}

impl FuzzOptions {
    pub fn new(iterations: u64) -> Self {
        Self {
            iterations,
            ..Self::default()
        }
    }

    pub fn with_crash_dir(mut self, crash_dir: impl Into<PathBuf>) -> Self {
        self.crash_dir = Some(crash_dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), FuzzError> {
        if self.iterations == 0 {
            return Err(FuzzError::InvalidConfig(
                "iteration count must be positive".to_string(),
            ));
        }
        if self.min_mutations == 0 {
            return Err(FuzzError::InvalidConfig(
                "mutation count per iteration must be positive".to_string(),
            ));
        }
        if self.min_mutations > self.max_mutations {
            return Err(FuzzError::InvalidConfig(format!(
                "min mutations ({}) exceeds max mutations ({})",
                self.min_mutations, self.max_mutations
            )));
        }
        if self.strategies.as_ref().is_some_and(|s| s.is_empty()) {
            return Err(GlitchError::EmptyStrategySet.into());
        }
        Ok(())
    }
}

/// Summary of a fuzzing session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FuzzReport {
    /// Iterations actually run; lower than requested only when cancelled.
    pub iterations: u64,
    /// Interesting results in iteration order. Without an oracle, every generated result.
    pub results: Vec<GlitchResult>,
    /// Crash files newly written during this session.
    pub crash_files: Vec<PathBuf>,
    pub cancelled: bool,
}

impl FuzzReport {
    pub fn interesting_count(&self) -> usize {
        self.results.iter().filter(|r| r.interesting).count()
    }

    /// Appends another worker's report after this one.
    pub fn merge(mut self, other: FuzzReport) -> Self {
        self.iterations += other.iterations;
        self.results.extend(other.results);
        self.crash_files.extend(other.crash_files);
        self.cancelled |= other.cancelled;
        self
    }
}

/// A test case written by [`GlitchEngine::generate_cases`].
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedCase {
    pub path: PathBuf,
    pub result: GlitchResult,
}

impl<R: Rng> GlitchEngine<R> {
    /// Repeatedly mutates `template` and classifies each variant with `oracle`.
    ///
    /// Per iteration: check `stop`, draw a mutation count from the configured range,
    /// glitch a fresh copy of the template, then probe the oracle. A crash verdict or a
    /// non-fatal oracle failure marks the result interesting; it is then persisted to
    /// the crash directory (if any) and appended to the report. Timeouts and clean runs
    /// are dropped. Fatal oracle failures and persistence failures abort the loop.
    ///
    /// Without an oracle the loop only generates: every result is returned unclassified.
    pub fn fuzz_loop(
        &mut self,
        template: &[u8],
        options: &FuzzOptions,
        oracle: Option<&dyn CrashOracle>,
        stop: Option<&StopToken>,
    ) -> Result<FuzzReport, FuzzError> {
        options.validate()?;
        let crash_corpus = options
            .crash_dir
            .as_ref()
            .map(CrashCorpus::open)
            .transpose()?;

        let mut report = FuzzReport::default();
        for i in 0..options.iterations {
            if stop.is_some_and(StopToken::is_stopped) {
                info!("Fuzzing cancelled after {i} iterations");
                report.cancelled = true;
                break;
            }

            let count = self
                .rng_mut()
                .random_range(options.min_mutations..=options.max_mutations);
            let (glitched, result) = self.glitch(template, count, options.strategies.as_deref())?;
            report.iterations += 1;

            let Some(oracle) = oracle else {
                report.results.push(result);
                continue;
            };

            let result = match oracle.probe(&glitched) {
                Ok(CrashVerdict::Crashed(reason)) => {
                    warn!("Iteration {i}: CRASH! {reason}");
                    result.into_crash(Some(reason))
                }
                Ok(CrashVerdict::TimedOut) | Ok(CrashVerdict::Clean) => {
                    log_progress(i, options.iterations, &report);
                    continue;
                }
                Err(e) if e.is_fatal() => return Err(FuzzError::OracleFatal(e.to_string())),
                Err(e) => {
                    warn!("Iteration {i}: oracle failed: {e}");
                    result.into_crash(Some(e.to_string()))
                }
            };

            if let Some(crash_corpus) = &crash_corpus {
                match crash_corpus.store(&glitched, &result.output_hash)? {
                    Stored::Written(path) => {
                        info!("Saved crashing input to {path:?}");
                        report.crash_files.push(path);
                    }
                    Stored::Duplicate(path) => info!("Crash already recorded at {path:?}"),
                }
            }
            report.results.push(result);
            log_progress(i, options.iterations, &report);
        }

        Ok(report)
    }

    /// Fuzzes an executable: each variant is passed to `harness` as a temp file.
    pub fn test_binary(
        &mut self,
        harness: &ProcessHarness,
        template: &[u8],
        options: &FuzzOptions,
        stop: Option<&StopToken>,
    ) -> Result<FuzzReport, FuzzError> {
        self.fuzz_loop(template, options, Some(harness), stop)
    }

    /// Writes `count` mutated variants of `template` to `dir` as
    /// `case_<index>_<fingerprint>.bin`.
    pub fn generate_cases(
        &mut self,
        template: &[u8],
        count: usize,
        mutations: usize,
        strategies: Option<&[Strategy]>,
        dir: &Path,
    ) -> Result<Vec<GeneratedCase>, FuzzError> {
        let mut cases = Vec::with_capacity(count);
        for index in 0..count {
            let (glitched, result) = self.glitch(template, mutations, strategies)?;
            let path = corpus::write_case(dir, index, &result.output_hash, &glitched)?;
            info!("Generated: {path:?}");
            cases.push(GeneratedCase { path, result });
        }
        Ok(cases)
    }
}

fn log_progress(i: u64, total: u64, report: &FuzzReport) {
    if i % PROGRESS_INTERVAL == 0 {
        info!("[{i}/{total}] {} interesting", report.interesting_count());
    }
}

/// Generator for worker `worker` of a parallel session: the shared seed, on its own stream.
pub fn worker_rng(seed: u64, worker: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(worker as u64);
    rng
}

/// Runs `options.iterations` iterations split across `threads` workers.
///
/// Each worker owns its engine and generator stream ([`worker_rng`]), so a given
/// `(seed, threads)` pair reproduces the same per-worker sequences. The oracle and the
/// content-addressed crash directory are shared. Reports are merged in worker order.
pub fn fuzz_parallel(
    template: &[u8],
    options: &FuzzOptions,
    threads: usize,
    seed: u64,
    oracle: Option<&dyn CrashOracle>,
    stop: Option<&StopToken>,
) -> Result<FuzzReport, FuzzError> {
    if threads == 0 {
        return Err(FuzzError::InvalidConfig(
            "worker thread count must be positive".to_string(),
        ));
    }
    options.validate()?;

    let per_worker = options.iterations / threads as u64;
    let remainder = options.iterations % threads as u64;

    let outcomes: Vec<Result<FuzzReport, FuzzError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|worker| {
                let share = per_worker + u64::from((worker as u64) < remainder);
                let worker_options = FuzzOptions {
                    iterations: share,
                    ..options.clone()
                };
                scope.spawn(move || {
                    if share == 0 {
                        return Ok(FuzzReport::default());
                    }
                    let mut engine = GlitchEngine::new(worker_rng(seed, worker));
                    engine.fuzz_loop(template, &worker_options, oracle, stop)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(FuzzError::WorkerPanicked(worker)))
            })
            .collect()
    });

    let mut merged = FuzzReport::default();
    for outcome in outcomes {
        merged = merged.merge(outcome?);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InProcessOracle;
    use crate::oracle::OracleError;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    const TEMPLATE: &[u8] = b"GLITCH\x00\x10\x00\x00\x00template body with some bytes";

    fn engine(seed: u64) -> GlitchEngine<ChaCha8Rng> {
        GlitchEngine::new(ChaCha8Rng::seed_from_u64(seed))
    }

    fn ff_oracle(input: &[u8]) -> Result<CrashVerdict, OracleError> {
        Ok(CrashVerdict::from(input.contains(&0xFF)))
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let options = FuzzOptions::new(200);
        let first = engine(1234)
            .fuzz_loop(TEMPLATE, &options, Some(&ff_oracle), None)
            .unwrap();
        let second = engine(1234)
            .fuzz_loop(TEMPLATE, &options, Some(&ff_oracle), None)
            .unwrap();

        assert_eq!(first.iterations, 200);
        assert!(!first.results.is_empty(), "0xFF oracle should fire in 200 runs");
        assert_eq!(first.results.len(), second.results.len());
        for (a, b) in first.results.iter().zip(&second.results) {
            assert!(a.same_outcome(b));
        }
    }

    #[test]
    fn interesting_results_are_flagged_crashes() {
        let report = engine(7)
            .fuzz_loop(TEMPLATE, &FuzzOptions::new(100), Some(&ff_oracle), None)
            .unwrap();
        for result in &report.results {
            assert!(result.crashed && result.interesting);
            let count = result.mutation_count();
            assert!((DEFAULT_MIN_MUTATIONS..=DEFAULT_MAX_MUTATIONS).contains(&count));
        }
        assert_eq!(report.interesting_count(), report.results.len());
    }

    #[test]
    fn without_oracle_every_iteration_is_returned() {
        let mut engine = engine(3);
        let report = engine
            .fuzz_loop(TEMPLATE, &FuzzOptions::new(25), None, None)
            .unwrap();
        assert_eq!(report.results.len(), 25);
        assert_eq!(report.interesting_count(), 0);
        assert_eq!(engine.results().len(), 25);
    }

    #[test]
    fn oracle_failures_are_interesting_and_loop_continues() {
        let calls = AtomicUsize::new(0);
        let flaky = |_: &[u8]| -> Result<CrashVerdict, OracleError> {
            if calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(OracleError::Other("target refused to launch".to_string()))
            } else {
                Ok(CrashVerdict::Clean)
            }
        };
        let report = engine(5)
            .fuzz_loop(TEMPLATE, &FuzzOptions::new(10), Some(&flaky), None)
            .unwrap();
        assert_eq!(report.iterations, 10);
        assert_eq!(report.results.len(), 5);
        for result in &report.results {
            assert!(result.interesting && result.crashed);
            assert_eq!(
                result.crash_info.as_deref(),
                Some("target refused to launch")
            );
        }
    }

    #[test]
    fn timeouts_are_not_interesting() {
        let hang = |_: &[u8]| -> Result<CrashVerdict, OracleError> { Ok(CrashVerdict::TimedOut) };
        let report = engine(6)
            .fuzz_loop(TEMPLATE, &FuzzOptions::new(20), Some(&hang), None)
            .unwrap();
        assert_eq!(report.iterations, 20);
        assert!(report.results.is_empty());
    }

    #[test]
    fn fatal_oracle_failure_aborts() {
        let full = |_: &[u8]| -> Result<CrashVerdict, OracleError> {
            Err(OracleError::Fatal("disk full".to_string()))
        };
        let err = engine(8)
            .fuzz_loop(TEMPLATE, &FuzzOptions::new(20), Some(&full), None)
            .unwrap_err();
        assert!(matches!(err, FuzzError::OracleFatal(_)));
    }

    #[test]
    fn crashes_are_persisted_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let crash_dir = dir.path().join("crashes");
        let options = FuzzOptions::new(150).with_crash_dir(&crash_dir);
        let report = engine(99)
            .fuzz_loop(TEMPLATE, &options, Some(&ff_oracle), None)
            .unwrap();

        let corpus = CrashCorpus::open(&crash_dir).unwrap();
        let stored = corpus.entries().unwrap();
        let mut unique: Vec<&str> = report.results.iter().map(|r| r.output_hash.as_str()).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(stored.len(), unique.len());
        assert_eq!(report.crash_files.len(), unique.len());
        for result in &report.results {
            let bytes = fs::read(corpus.path_for(&result.output_hash)).unwrap();
            assert!(bytes.contains(&0xFF));
        }
    }

    #[test]
    fn identical_crashing_outputs_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        // A single byte under one bit flip has only eight possible outputs.
        let options = FuzzOptions {
            iterations: 40,
            min_mutations: 1,
            max_mutations: 1,
            strategies: Some(vec![Strategy::BitFlip]),
            crash_dir: Some(dir.path().to_path_buf()),
        };
        let always = |_: &[u8]| -> Result<CrashVerdict, OracleError> { Ok(CrashVerdict::from(true)) };
        let report = engine(11)
            .fuzz_loop(b"\x00", &options, Some(&always), None)
            .unwrap();

        assert_eq!(report.results.len(), 40);
        let files = CrashCorpus::open(dir.path()).unwrap().entries().unwrap();
        assert!(files.len() <= 8, "at most one file per flipped bit");
        assert_eq!(files.len(), report.crash_files.len());
    }

    #[test]
    fn unwritable_crash_dir_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();
        let options = FuzzOptions::new(5).with_crash_dir(&blocker);
        let err = engine(1)
            .fuzz_loop(TEMPLATE, &options, Some(&ff_oracle), None)
            .unwrap_err();
        assert!(matches!(err, FuzzError::CrashPersist(_)));
    }

    #[test]
    fn stop_token_cancels_before_next_iteration() {
        let stop = StopToken::new();
        let calls = AtomicUsize::new(0);
        let stopper = |_: &[u8]| -> Result<CrashVerdict, OracleError> {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                stop.stop();
            }
            Ok(CrashVerdict::Clean)
        };
        let report = engine(2)
            .fuzz_loop(TEMPLATE, &FuzzOptions::new(100), Some(&stopper), Some(&stop))
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.iterations, 3);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let mut engine = engine(0);
        for options in [
            FuzzOptions::new(0),
            FuzzOptions {
                min_mutations: 0,
                ..FuzzOptions::default()
            },
            FuzzOptions {
                min_mutations: 4,
                max_mutations: 2,
                ..FuzzOptions::default()
            },
        ] {
            assert!(matches!(
                engine.fuzz_loop(TEMPLATE, &options, None, None),
                Err(FuzzError::InvalidConfig(_))
            ));
        }
        let empty = FuzzOptions {
            strategies: Some(Vec::new()),
            ..FuzzOptions::default()
        };
        assert!(matches!(
            engine.fuzz_loop(TEMPLATE, &empty, None, None),
            Err(FuzzError::Glitch(GlitchError::EmptyStrategySet))
        ));
    }

    #[test]
    fn parallel_run_covers_all_iterations_and_is_reproducible() {
        let options = FuzzOptions::new(103);
        let first = fuzz_parallel(TEMPLATE, &options, 4, 77, Some(&ff_oracle), None).unwrap();
        let second = fuzz_parallel(TEMPLATE, &options, 4, 77, Some(&ff_oracle), None).unwrap();
        assert_eq!(first.iterations, 103);
        assert_eq!(first.results.len(), second.results.len());
        for (a, b) in first.results.iter().zip(&second.results) {
            assert!(a.same_outcome(b));
        }
    }

    #[test]
    fn parallel_worker_matches_single_worker_stream() {
        let options = FuzzOptions::new(30);
        let parallel = fuzz_parallel(TEMPLATE, &options, 1, 5, None, None).unwrap();
        let single = GlitchEngine::new(worker_rng(5, 0))
            .fuzz_loop(TEMPLATE, &options, None, None)
            .unwrap();
        assert_eq!(parallel.results.len(), single.results.len());
        for (a, b) in parallel.results.iter().zip(&single.results) {
            assert!(a.same_outcome(b));
        }
    }

    #[test]
    fn parallel_workers_share_one_crash_file_per_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let options = FuzzOptions {
            iterations: 200,
            min_mutations: 1,
            max_mutations: 1,
            strategies: Some(vec![Strategy::BitFlip]),
            crash_dir: Some(dir.path().to_path_buf()),
        };
        let always = |_: &[u8]| -> Result<CrashVerdict, OracleError> { Ok(CrashVerdict::from(true)) };
        let report = fuzz_parallel(b"\x00", &options, 4, 13, Some(&always), None).unwrap();

        assert_eq!(report.results.len(), 200);
        let mut fingerprints: Vec<&str> =
            report.results.iter().map(|r| r.output_hash.as_str()).collect();
        fingerprints.sort();
        fingerprints.dedup();

        let files = CrashCorpus::open(dir.path()).unwrap().entries().unwrap();
        assert_eq!(files.len(), fingerprints.len());
        let mut written = report.crash_files.clone();
        written.sort();
        assert_eq!(written, files, "every file claimed by exactly one worker");
    }

        #[test]
    fn parallel_rejects_zero_threads() {
        assert!(matches!(
            fuzz_parallel(TEMPLATE, &FuzzOptions::new(10), 0, 1, None, None),
            Err(FuzzError::InvalidConfig(_))
        ));
    }

    #[test]
    fn generate_cases_writes_every_case() {
        let dir = tempfile::tempdir().unwrap();
        let cases = engine(21)
            .generate_cases(TEMPLATE, 12, 3, None, dir.path())
            .unwrap();
        assert_eq!(cases.len(), 12);
        for (index, case) in cases.iter().enumerate() {
            let name = case.path.file_name().unwrap().to_string_lossy().into_owned();
            assert_eq!(
                name,
                format!("case_{index:04}_{}.bin", case.result.output_hash)
            );
            assert_eq!(case.result.mutation_count(), 3);
            assert!(case.path.exists());
        }
    }

    /// Length-prefixed record parser that trusts its declared length.
    fn parse_record(data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = &data[4..];
        assert!(
            declared <= body.len(),
            "declared length {declared} exceeds body of {} bytes",
            body.len()
        );
    }

    #[test]
    fn in_process_target_panics_are_crashes() {
        let oracle = InProcessOracle::new(parse_record);
        let options = FuzzOptions {
            iterations: 40,
            min_mutations: 1,
            max_mutations: 1,
            strategies: Some(vec![Strategy::LengthCorruption]),
            crash_dir: None,
        };
        let report = engine(19)
            .fuzz_loop(b"\x05\x00\x00\x00hello", &options, Some(&oracle), None)
            .unwrap();

        assert_eq!(report.iterations, 40);
        assert!(!report.results.is_empty());
        assert!(report.results.len() < 40, "a zeroed length parses cleanly");
        for result in &report.results {
            assert_eq!(result.mutations[0].offset, 0);
            let info = result.crash_info.as_deref().unwrap();
            assert!(info.contains("declared length"), "{info}");
        }
    }

        #[cfg(unix)]
    #[test]
    fn test_binary_finds_crashes_in_external_target() {
        use crate::executor::HarnessConfig;
        use std::time::Duration;

        let script = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../test_targets/target_ff.sh");
        let harness = ProcessHarness::new(HarnessConfig {
            command: vec!["sh".to_string(), script.to_string_lossy().into_owned()],
            timeout: Duration::from_secs(5),
            working_dir: None,
            temp_dir: None,
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let options = FuzzOptions {
            strategies: Some(vec![Strategy::ByteOverwrite]),
            ..FuzzOptions::new(15).with_crash_dir(dir.path())
        };

        let mut engine = engine(31);
        let report = engine
            .test_binary(&harness, b"\x00\x00\x00\x00", &options, None)
            .unwrap();
        assert_eq!(report.iterations, 15);
        assert_eq!(engine.results().len(), 15);
        for result in &report.results {
            assert!(result.crash_info.as_deref().unwrap_or("").contains("SIGSEGV"));
            let stored = fs::read(dir.path().join(format!("crash_{}.bin", result.output_hash)))
                .unwrap();
            assert!(stored.contains(&0xFF));
        }
    }
}
