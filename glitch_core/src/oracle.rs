use std::fmt;
use thiserror::Error;

/// The classification a [`CrashOracle`] gives one mutated input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashVerdict {
    /// The target handled the input without a fatal failure.
    Clean,
    /// The target crashed. The string is a human-readable diagnostic
    /// (e.g. which signal terminated the process).
    Crashed(String),
    /// The target did not finish in time. Hangs are benign, not crashes.
    TimedOut,
}

impl CrashVerdict {
    /// Returns `true` only for [`CrashVerdict::Crashed`].
    pub fn is_crash(&self) -> bool {
        matches!(self, CrashVerdict::Crashed(_))
    }
}

impl From<bool> for CrashVerdict {
    /// Lifts a plain "did it crash" predicate result into a verdict.
    fn from(crashed: bool) -> Self {
        if crashed {
            CrashVerdict::Crashed("oracle reported a crash".to_string())
        } else {
            CrashVerdict::Clean
        }
    }
}

impl fmt::Display for CrashVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashVerdict::Clean => f.write_str("clean"),
            CrashVerdict::Crashed(reason) => write!(f, "crashed: {reason}"),
            CrashVerdict::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Failures of the oracle itself, as opposed to crashes of the target.
///
/// A fuzzing loop records non-fatal failures as interesting results and keeps going;
/// fatal ones stop the loop (see [`OracleError::is_fatal`]).
#[derive(Error, Debug)]
pub enum OracleError {
    /// The transient input file could not be created or written.
    #[error("Failed to prepare temp input file: {0}")]
    TempFile(#[source] std::io::Error),

    /// The target process could not be started.
    #[error("Failed to spawn command '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on, or killing, the target process failed.
    #[error("Error waiting for child: {0}")]
    Wait(#[source] std::io::Error),

    /// The harness can no longer run at all (e.g. the disk holding temp files is full).
    #[error("Fatal harness failure: {0}")]
    Fatal(String),

    /// Any other failure raised by a caller-supplied oracle.
    #[error("{0}")]
    Other(String),
}

impl OracleError {
    /// Whether the failure makes every further iteration pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OracleError::Fatal(_))
    }
}

/// A `CrashOracle` decides whether a mutated input makes the target fail.
///
/// This is the only seam between the fuzz loop and the target: a process harness
/// spawning an executable is one implementation, a pure in-memory predicate is another.
/// Oracles are `Send + Sync` so one instance can serve several fuzzing workers.
///
/// Any `Fn(&[u8]) -> Result<CrashVerdict, OracleError>` closure is an oracle.
pub trait CrashOracle: Send + Sync {
    /// Runs the target against `input` and classifies the outcome.
    ///
    /// # Returns
    /// * `Ok(verdict)`: the target ran and was classified.
    /// * `Err(error)`: the oracle could not produce a verdict.
    fn probe(&self, input: &[u8]) -> Result<CrashVerdict, OracleError>;
}

impl<F> CrashOracle for F
where
    F: Fn(&[u8]) -> Result<CrashVerdict, OracleError> + Send + Sync,
{
    fn probe(&self, input: &[u8]) -> Result<CrashVerdict, OracleError> {
        self(input)
    }
}
