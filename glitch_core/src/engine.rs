use crate::fingerprint::fingerprint;
use crate::mutator::{Mutation, MutationError, Strategy, UnknownStrategy};
use chrono::{DateTime, Utc};
use log::debug;
use rand::Rng;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by [`GlitchEngine`] operations.
#[derive(Error, Debug)]
pub enum GlitchError {
    /// A strategy filter named something outside the canonical set.
    #[error(transparent)]
    UnknownStrategy(#[from] UnknownStrategy),

    /// The strategy filter resolved to nothing.
    #[error("Strategy set is empty, nothing to mutate with")]
    EmptyStrategySet,

    /// Every active strategy needs more bytes than the current buffer holds.
    #[error("No active strategy can mutate a {len}-byte buffer")]
    NoApplicableStrategy { len: usize },

    /// A strategy rejected its parameters.
    #[error("Mutation failed: {0}")]
    Mutation(#[from] MutationError),

    /// Reading or writing a glitched file failed.
    #[error("Glitch I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one mutation episode.
#[derive(Debug, Clone, Serialize)]
pub struct GlitchResult {
    /// Fingerprint of the buffer before any mutation.
    pub input_hash: String,
    /// Fingerprint of the buffer after the last mutation.
    pub output_hash: String,
    /// Applied mutations, in order.
    pub mutations: Vec<Mutation>,
    pub crashed: bool,
    /// Diagnostic from the crash oracle, if any.
    pub crash_info: Option<String>,
    /// Set when the oracle reported a crash or failed itself.
    pub interesting: bool,
    pub timestamp: DateTime<Utc>,
}

impl GlitchResult {
    fn new(input_hash: String, output_hash: String, mutations: Vec<Mutation>) -> Self {
        Self {
            input_hash,
            output_hash,
            mutations,
            crashed: false,
            crash_info: None,
            interesting: false,
            timestamp: Utc::now(),
        }
    }

    /// Marks the result as an interesting crash, attaching the oracle's diagnostic.
    pub fn into_crash(self, crash_info: Option<String>) -> Self {
        Self {
            crashed: true,
            crash_info,
            interesting: true,
            ..self
        }
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.len()
    }

    /// Whether both results describe the same episode, ignoring capture time.
    pub fn same_outcome(&self, other: &GlitchResult) -> bool {
        self.input_hash == other.input_hash
            && self.output_hash == other.output_hash
            && self.mutations == other.mutations
            && self.crashed == other.crashed
            && self.crash_info == other.crash_info
            && self.interesting == other.interesting
    }
}

/// Resolves a case-insensitive list of strategy names into registry order.
///
/// Duplicates collapse; an unknown name or an empty list is a configuration error.
pub fn resolve_strategies<S: AsRef<str>>(names: &[S]) -> Result<Vec<Strategy>, GlitchError> {
    let mut wanted = Vec::with_capacity(names.len());
    for name in names {
        wanted.push(name.as_ref().parse::<Strategy>()?);
    }
    let resolved: Vec<Strategy> = Strategy::ALL
        .into_iter()
        .filter(|strategy| wanted.contains(strategy))
        .collect();
    if resolved.is_empty() {
        return Err(GlitchError::EmptyStrategySet);
    }
    Ok(resolved)
}

/// Default output location for [`GlitchEngine::glitch_file`]:
/// `<stem>_glitched<.ext>` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = match input.extension() {
        Some(ext) => format!("{stem}_glitched.{}", ext.to_string_lossy()),
        None => format!("{stem}_glitched"),
    };
    input.with_file_name(file_name)
}

/// Applies chains of randomly selected mutations to byte buffers.
///
/// The random source is injected at construction, so a seeded generator makes every
/// episode reproducible. Each call to [`glitch`](Self::glitch) also appends its result
/// to an audit trail readable through [`results`](Self::results); nothing in the
/// engine consults that trail.
pub struct GlitchEngine<R: Rng> {
    rng: R,
    results: Vec<GlitchResult>,
}

impl<R: Rng> GlitchEngine<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            results: Vec::new(),
        }
    }

    /// Audit trail of every episode produced so far, in order.
    pub fn results(&self) -> &[GlitchResult] {
        &self.results
    }

    /// Drains the audit trail.
    pub fn take_results(&mut self) -> Vec<GlitchResult> {
        std::mem::take(&mut self.results)
    }

    pub(crate) fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Applies `count` mutations in sequence, each one to the output of the previous.
    ///
    /// Every step draws uniformly from the strategies in `strategies` (all of them when
    /// `None`) that can handle the current buffer length, so a chain may shrink the
    /// buffer with `Truncation` and keep going with strategies that still fit. When none
    /// fits the chain aborts with [`GlitchError::NoApplicableStrategy`].
    ///
    /// `count == 0` is a no-op: the output equals the input and the record is empty.
    pub fn glitch(
        &mut self,
        data: &[u8],
        count: usize,
        strategies: Option<&[Strategy]>,
    ) -> Result<(Vec<u8>, GlitchResult), GlitchError> {
        let active = strategies.unwrap_or(&Strategy::ALL);
        if active.is_empty() {
            return Err(GlitchError::EmptyStrategySet);
        }

        let input_hash = fingerprint(data);
        let mut current = data.to_vec();
        let mut mutations = Vec::with_capacity(count);

        for _ in 0..count {
            let eligible: Vec<Strategy> = active
                .iter()
                .copied()
                .filter(|strategy| strategy.applies_to(current.len()))
                .collect();
            if eligible.is_empty() {
                return Err(GlitchError::NoApplicableStrategy { len: current.len() });
            }
            let strategy = eligible[self.rng.random_range(0..eligible.len())];
            let (next, mutation) = strategy.mutate(&current, None, &mut self.rng)?;
            debug!("Applied {}: {}", strategy, mutation.description);
            current = next;
            mutations.push(mutation);
        }

        let result = GlitchResult::new(input_hash, fingerprint(&current), mutations);
        self.results.push(result.clone());
        Ok((current, result))
    }

    /// Like [`glitch`](Self::glitch), with the strategy filter given by name.
    pub fn glitch_named<S: AsRef<str>>(
        &mut self,
        data: &[u8],
        count: usize,
        strategy_names: &[S],
    ) -> Result<(Vec<u8>, GlitchResult), GlitchError> {
        let strategies = resolve_strategies(strategy_names)?;
        self.glitch(data, count, Some(strategies.as_slice()))
    }

    /// Reads `input`, glitches it and writes the result to `output`
    /// (or [`default_output_path`]). Returns the written path and the result.
    pub fn glitch_file(
        &mut self,
        input: &Path,
        output: Option<&Path>,
        count: usize,
        strategies: Option<&[Strategy]>,
    ) -> Result<(PathBuf, GlitchResult), GlitchError> {
        let data = fs::read(input).map_err(|source| GlitchError::Io {
            path: input.to_path_buf(),
            source,
        })?;
        let (glitched, result) = self.glitch(&data, count, strategies)?;

        let output_path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(input));
        fs::write(&output_path, &glitched).map_err(|source| GlitchError::Io {
            path: output_path.clone(),
            source,
        })?;
        debug!("Glitched file saved to {output_path:?}");
        Ok((output_path, result))
    }
}
