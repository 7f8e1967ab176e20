pub mod config;
pub mod corpus;
pub mod diff;
pub mod engine;
pub mod executor;
pub mod fingerprint;
pub mod fuzz;
pub mod mutator;
pub mod oracle;

pub use config::GlitchConfig;
pub use corpus::{CorpusError, CrashCorpus, Stored};
pub use diff::{ByteDiff, GlitchDiff, analyze};
pub use engine::{GlitchEngine, GlitchError, GlitchResult, resolve_strategies};
pub use executor::{HarnessConfig, InProcessOracle, ProcessHarness, ProcessOutcome, ProcessOutput};
pub use fingerprint::fingerprint;
pub use fuzz::{FuzzError, FuzzOptions, FuzzReport, GeneratedCase, StopToken, fuzz_parallel};
pub use mutator::{Mutation, MutationError, Strategy};
pub use oracle::{CrashOracle, CrashVerdict, OracleError};
