use crate::oracle::{CrashOracle, CrashVerdict, OracleError};
use log::warn;
use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long pipe readers get to finish after lingering descendants were killed.
const PIPE_GRACE: Duration = Duration::from_millis(100);

/// Shells report a child killed by signal N as exit code 128 + N.
const SHELL_SIGNAL_EXIT_BASE: i32 = 128;

#[cfg(unix)]
const FATAL_SIGNALS: [(i32, &str); 4] = [
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGABRT, "SIGABRT"),
    (libc::SIGILL, "SIGILL"),
    (libc::SIGBUS, "SIGBUS"),
];

#[cfg(not(unix))]
const FATAL_SIGNALS: [(i32, &str); 4] = [
    (11, "SIGSEGV"),
    (6, "SIGABRT"),
    (4, "SIGILL"),
    (7, "SIGBUS"),
];

fn fatal_signal_name(signal: i32) -> Option<&'static str> {
    FATAL_SIGNALS
        .iter()
        .find(|(number, _)| *number == signal)
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Program followed by any leading arguments. The input file path is appended last.
    pub command: Vec<String>,
    /// Wall-clock budget for one run, including collecting the target's output.
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// Where input files are staged. The system temp directory when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl HarnessConfig {
    /// `executable <input-file>` with a whole-second timeout.
    pub fn new(executable: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            command: vec![executable.into()],
            timeout: Duration::from_secs(timeout_secs),
            working_dir: None,
            temp_dir: None,
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            stdout,
            stderr,
            exit_code: status.code(),
            signal,
        }
    }

    /// Describes the crash if the process died from SIGSEGV, SIGABRT, SIGILL or SIGBUS,
    /// either directly or as reported by a wrapping shell (exit code 128 + signal).
    /// Every other termination, including non-zero exits, is not a crash.
    pub fn crash_reason(&self) -> Option<String> {
        if let Some(signal) = self.signal {
            return fatal_signal_name(signal)
                .map(|name| format!("Terminated by signal {signal} ({name})"));
        }
        let code = self.exit_code?;
        let signal = code.checked_sub(SHELL_SIGNAL_EXIT_BASE)?;
        fatal_signal_name(signal).map(|name| format!("Exited with code {code} ({name})"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ProcessOutput),
    TimedOut,
}

/// Runs an external executable against each input, passed as a transient file.
///
/// The temp file lives exactly as long as one [`run`](Self::run) call and is removed on
/// every exit path, including spawn failures and timeouts.
///
/// On unix the target runs in its own process group. A timeout kills the whole group, and
/// so does a target that exits while descendants keep its output pipes open past the
/// deadline. Either way `run` returns within the timeout plus a short grace period.
pub struct ProcessHarness {
    config: HarnessConfig,
}

impl ProcessHarness {
    pub fn new(config: HarnessConfig) -> Result<Self, OracleError> {
        if config.command.is_empty() {
            return Err(OracleError::Other("Harness command is empty".to_string()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn run(&self, input: &[u8]) -> Result<ProcessOutcome, OracleError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("glitch_").suffix(".bin");
        let mut input_file = match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(temp_file_error)?;
        input_file
            .as_file_mut()
            .write_all(input)
            .and_then(|_| input_file.as_file_mut().flush())
            .map_err(temp_file_error)?;

        let program = &self.config.command[0];
        let mut cmd = Command::new(program);
        cmd.args(&self.config.command[1..])
            .arg(input_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut child = cmd.spawn().map_err(|source| OracleError::Launch {
            program: program.clone(),
            source,
        })?;
        let stdout_reader = child.stdout.take().map(drain_pipe);
        let stderr_reader = child.stderr.take().map(drain_pipe);

        let outcome = match wait_until(&mut child, deadline)? {
            Some(status) => {
                let mut stdout = recv_before(&stdout_reader, deadline);
                let mut stderr = recv_before(&stderr_reader, deadline);
                if stdout.is_none() || stderr.is_none() {
                    warn!("Target exited but its descendants still hold its output open, killing them");
                    if let Err(e) = kill_process_group(&mut child) {
                        warn!("Failed to kill lingering descendants: {e}");
                    }
                    let grace = Instant::now() + PIPE_GRACE;
                    stdout = stdout.or_else(|| recv_before(&stdout_reader, grace));
                    stderr = stderr.or_else(|| recv_before(&stderr_reader, grace));
                }
                ProcessOutcome::Exited(ProcessOutput::from_status(
                    status,
                    stdout.unwrap_or_default(),
                    stderr.unwrap_or_default(),
                ))
            }
            // The group is dead; readers see EOF and exit on their own.
            None => ProcessOutcome::TimedOut,
        };

        drop(input_file);
        Ok(outcome)
    }
}

impl CrashOracle for ProcessHarness {
    fn probe(&self, input: &[u8]) -> Result<CrashVerdict, OracleError> {
        match self.run(input)? {
            ProcessOutcome::Exited(output) => Ok(output
                .crash_reason()
                .map(CrashVerdict::Crashed)
                .unwrap_or(CrashVerdict::Clean)),
            ProcessOutcome::TimedOut => Ok(CrashVerdict::TimedOut),
        }
    }
}

fn temp_file_error(err: std::io::Error) -> OracleError {
    if err.kind() == ErrorKind::StorageFull {
        OracleError::Fatal(format!("No space left for temp input file: {err}"))
    } else {
        OracleError::TempFile(err)
    }
}

/// Reads `pipe` to EOF on a background thread; the bytes arrive on the returned channel.
fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            warn!("Failed to read target output: {e}");
        }
        // The harness may have stopped listening already.
        let _ = tx.send(buf);
    });
    rx
}

/// `None` if the reader has not hit EOF by `deadline`. A missing pipe reads as empty.
fn recv_before(reader: &Option<Receiver<Vec<u8>>>, deadline: Instant) -> Option<Vec<u8>> {
    match reader {
        Some(rx) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok(),
        None => Some(Vec::new()),
    }
}

/// Sends SIGKILL to the child's process group, taking down anything it spawned.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg has no memory effects; the group was created for this child by
    // `process_group(0)` and still has a member whenever this is called.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    match child.kill() {
        Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

/// Polls the child until it exits or `deadline` passes. On timeout the child's process
/// group is killed, the child reaped, and `Ok(None)` returned.
fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>, OracleError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!("Target timed out, killing its process group...");
                    kill_process_group(child).map_err(OracleError::Wait)?;
                    child.wait().map_err(OracleError::Wait)?;
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(OracleError::Wait(e)),
        }
    }
}

/// Oracle for in-process targets: a panic inside `target` is the crash.
///
/// Handy for fuzzing a parser linked into the same binary without spawning anything.
/// The target must be built with `panic = "unwind"`.
pub struct InProcessOracle<F> {
    target: F,
}

impl<F> InProcessOracle<F>
where
    F: Fn(&[u8]) + Send + Sync,
{
    pub fn new(target: F) -> Self {
        Self { target }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "target panicked with a non-string payload".to_string())
}

impl<F> CrashOracle for InProcessOracle<F>
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn probe(&self, input: &[u8]) -> Result<CrashVerdict, OracleError> {
        match catch_unwind(AssertUnwindSafe(|| (self.target)(input))) {
            Ok(()) => Ok(CrashVerdict::Clean),
            Err(payload) => Ok(CrashVerdict::Crashed(format!(
                "panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

#[cfg(test)]
mod in_process_oracle_tests {
    use super::*;

    fn panicking_target(data: &[u8]) {
        if data.first() == Some(&0xFF) {
            panic!("Boom!");
        }
    }

    #[test]
    fn in_process_oracle_passes_clean_input() {
        let oracle = InProcessOracle::new(panicking_target);
        assert_eq!(oracle.probe(&[1, 2, 3]).unwrap(), CrashVerdict::Clean);
    }

    #[test]
    fn in_process_oracle_catches_panic() {
        let oracle = InProcessOracle::new(panicking_target);
        match oracle.probe(&[0xFF]).unwrap() {
            CrashVerdict::Crashed(msg) => assert!(msg.contains("Boom!")),
            other => panic!("Expected a crash, got {other:?}"),
        }
    }

    #[test]
    fn crash_reason_recognises_fatal_signals() {
        let segv = ProcessOutput {
            signal: Some(FATAL_SIGNALS[0].0),
            ..Default::default()
        };
        assert!(segv.crash_reason().unwrap().contains("SIGSEGV"));

        let killed = ProcessOutput {
            signal: Some(9),
            ..Default::default()
        };
        assert_eq!(killed.crash_reason(), None);
    }

    #[test]
    fn crash_reason_recognises_shell_encoded_exit_codes() {
        let abort = ProcessOutput {
            exit_code: Some(SHELL_SIGNAL_EXIT_BASE + FATAL_SIGNALS[1].0),
            ..Default::default()
        };
        assert!(abort.crash_reason().unwrap().contains("SIGABRT"));

        for code in [0, 1, 2, 127, 255] {
            let normal = ProcessOutput {
                exit_code: Some(code),
                ..Default::default()
            };
            assert_eq!(normal.crash_reason(), None, "exit code {code}");
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let config = HarnessConfig {
            command: Vec::new(),
            timeout: Duration::from_secs(1),
            working_dir: None,
            temp_dir: None,
        };
        assert!(ProcessHarness::new(config).is_err());
    }
}

#[cfg(all(test, unix))]
mod process_harness_tests {
    use super::*;
    use std::path::Path;

    fn target_config(name: &str, timeout: Duration) -> HarnessConfig {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let script = manifest_dir.join("../test_targets").join(name);
        if !script.exists() {
            panic!("Test target missing: {script:?}");
        }
        HarnessConfig {
            command: vec!["sh".to_string(), script.to_string_lossy().into_owned()],
            timeout,
            working_dir: None,
            temp_dir: None,
        }
    }

    fn target_harness(name: &str, timeout: Duration) -> ProcessHarness {
        ProcessHarness::new(target_config(name, timeout)).unwrap()
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn clean_exit_is_not_a_crash() {
        let harness = target_harness("target_ok.sh", Duration::from_secs(5));
        assert_eq!(harness.probe(b"hello").unwrap(), CrashVerdict::Clean);
    }

    #[test]
    fn non_zero_exit_is_not_a_crash() {
        let harness = target_harness("target_exit_code.sh", Duration::from_secs(5));
        match harness.run(b"hello").unwrap() {
            ProcessOutcome::Exited(output) => assert_eq!(output.exit_code, Some(3)),
            other => panic!("Expected exit, got {other:?}"),
        }
        assert_eq!(harness.probe(b"hello").unwrap(), CrashVerdict::Clean);
    }

    #[test]
    fn segfault_is_a_crash() {
        let harness = target_harness("target_segv.sh", Duration::from_secs(5));
        match harness.probe(b"anything").unwrap() {
            CrashVerdict::Crashed(desc) => assert!(desc.contains("SIGSEGV"), "{desc}"),
            other => panic!("Expected crash, got {other:?}"),
        }
    }

    #[test]
    fn abort_is_a_crash() {
        let harness = target_harness("target_abort.sh", Duration::from_secs(5));
        match harness.probe(b"anything").unwrap() {
            CrashVerdict::Crashed(desc) => assert!(desc.contains("SIGABRT"), "{desc}"),
            other => panic!("Expected crash, got {other:?}"),
        }
    }

    #[test]
    fn shell_encoded_segfault_exit_code_is_a_crash() {
        let harness = target_harness("target_exit_139.sh", Duration::from_secs(5));
        match harness.probe(b"anything").unwrap() {
            CrashVerdict::Crashed(desc) => assert!(desc.contains("code 139"), "{desc}"),
            other => panic!("Expected crash, got {other:?}"),
        }
    }

    #[test]
    fn timeout_is_benign() {
        let harness = target_harness("target_hang.sh", Duration::from_millis(200));
        let start = Instant::now();
        assert_eq!(harness.probe(b"slow").unwrap(), CrashVerdict::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn crash_depends_on_file_contents() {
        let harness = target_harness("target_file_check.sh", Duration::from_secs(5));
        assert_eq!(harness.probe(b"OK_FILE").unwrap(), CrashVerdict::Clean);
        assert!(harness.probe(b"xxCRASHxx").unwrap().is_crash());
    }

    #[test]
    fn output_is_captured_and_temp_file_removed() {
        let harness = target_harness("target_echo_path.sh", Duration::from_secs(5));
        let output = match harness.run(b"payload").unwrap() {
            ProcessOutcome::Exited(output) => output,
            other => panic!("Expected exit, got {other:?}"),
        };
        let stdout = String::from_utf8(output.stdout).unwrap();
        let mut lines = stdout.lines();
        let path = lines.next().unwrap();
        assert_eq!(lines.next(), Some("payload"));
        assert!(!Path::new(path).exists(), "temp file {path} left behind");
        assert_eq!(output.stderr, b"diagnostics\n");
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let harness = ProcessHarness::new(HarnessConfig::new(
            "./this_command_does_not_exist_ever_12345",
            1,
        ))
        .unwrap();
        match harness.probe(b"x") {
            Err(OracleError::Launch { program, .. }) => {
                assert!(program.contains("does_not_exist"))
            }
            other => panic!("Expected launch error, got {other:?}"),
        }
    }

    #[test]
    fn background_descendant_does_not_outlive_timeout() {
        let harness = target_harness("target_background.sh", Duration::from_secs(1));
        let start = Instant::now();
        let verdict = harness.probe(b"x").unwrap();
        let elapsed = start.elapsed();
        assert_eq!(verdict, CrashVerdict::Clean);
        assert!(elapsed < Duration::from_secs(3), "run took {elapsed:?}");
    }

    #[test]
    fn background_descendant_is_killed_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still_running");
        let harness = ProcessHarness::new(HarnessConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "(sleep 2; touch \"$1\") & exec sleep 10".to_string(),
                "sh".to_string(),
                marker.to_string_lossy().into_owned(),
            ],
            timeout: Duration::from_millis(300),
            working_dir: None,
            temp_dir: None,
        })
        .unwrap();
        assert_eq!(harness.probe(b"x").unwrap(), CrashVerdict::TimedOut);
        std::thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists(), "descendant survived the timeout");
    }

    #[test]
    fn temp_file_removed_after_timeout() {
        let staging = tempfile::tempdir().unwrap();
        let harness = ProcessHarness::new(
            target_config("target_hang.sh", Duration::from_millis(300)).with_temp_dir(staging.path()),
        )
        .unwrap();
        assert_eq!(harness.probe(b"slow").unwrap(), CrashVerdict::TimedOut);
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[test]
    fn temp_file_removed_after_launch_failure() {
        let staging = tempfile::tempdir().unwrap();
        let harness = ProcessHarness::new(
            HarnessConfig::new("./this_command_does_not_exist_ever_12345", 1)
                .with_temp_dir(staging.path()),
        )
        .unwrap();
        assert!(matches!(harness.probe(b"x"), Err(OracleError::Launch { .. })));
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[test]
    fn temp_file_removed_after_crash() {
        let staging = tempfile::tempdir().unwrap();
        let harness = ProcessHarness::new(
            target_config("target_segv.sh", Duration::from_secs(5)).with_temp_dir(staging.path()),
        )
        .unwrap();
        assert!(harness.probe(b"x").unwrap().is_crash());
        assert_eq!(staged_files(staging.path()), 0);
    }
}
