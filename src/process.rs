//! Subprocess execution for the packing pipeline.
//!
//! Every external tool (npm, mksquashfs, configure/make, vcbuild.bat, cc)
//! goes through [`Cmd`]. Three execution modes:
//! - `run()`: capture output, for version checks and short commands
//! - `run_interactive()`: inherit stdio, for long builds the user watches
//! - `run_logged()`: append output to a log file, replayed on failure
//!
//! No retries and no timeouts: native builds legitimately run for an hour,
//! and a failed tool is reported once with its exit status.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

/// An external command exited with a failure status.
///
/// Wrapped in `anyhow::Error` so callers that only care about "the build
/// failed" see a readable message, while the pipeline can still downcast
/// to distinguish tool failures from configuration errors.
#[derive(Debug, Error)]
#[error("`{command}` failed with {status}")]
pub struct ProcessError {
    pub command: String,
    pub status: ExitStatus,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct Exec {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Exec {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for a single external command invocation.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, val: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), val.into()));
        self
    }

    /// Message prefixed to the error when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// A non-zero exit is returned as a normal `Exec` instead of an error.
    /// A command that cannot be spawned at all is still an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// The command line as shown in logs and error messages.
    pub fn render(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, val) in &self.envs {
            command.env(key, val);
        }
        command
    }

    /// Run with stdout/stderr captured.
    pub fn run(self) -> Result<Exec> {
        let rendered = self.render();
        let output = self
            .command()
            .output()
            .with_context(|| format!("failed to spawn `{}`", rendered))?;

        let exec = Exec {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !exec.success() && !self.allow_fail {
            return Err(self.failure(rendered, exec.status, Some(&exec)));
        }
        Ok(exec)
    }

    /// Run with stdio inherited so the user sees tool output live.
    /// Announces the command on stderr first.
    pub fn run_interactive(self) -> Result<()> {
        let rendered = self.render();
        eprintln!("-> running {}", rendered);
        let status = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("failed to spawn `{}`", rendered))?;

        if !status.success() && !self.allow_fail {
            return Err(self.failure(rendered, status, None));
        }
        Ok(())
    }

    /// Run with combined output appended to `log_path`. On failure the
    /// portion of the log written by this command is replayed to stderr,
    /// so `--quiet` never hides the reason a build stopped.
    pub fn run_logged(self, log_path: &Path) -> Result<()> {
        let rendered = self.render();
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("opening capture log {}", log_path.display()))?;
        let section_start = log
            .metadata()
            .with_context(|| format!("reading capture log {}", log_path.display()))?
            .len();
        writeln!(log, "-> running {}", rendered)?;

        let output = self
            .command()
            .output()
            .with_context(|| format!("failed to spawn `{}`", rendered))?;
        log.write_all(&output.stdout)?;
        log.write_all(&output.stderr)?;
        log.flush()?;

        if !output.status.success() && !self.allow_fail {
            replay_log_section(log_path, section_start);
            return Err(self.failure(rendered, output.status, None));
        }
        Ok(())
    }

    fn failure(&self, command: String, status: ExitStatus, exec: Option<&Exec>) -> anyhow::Error {
        let error = anyhow::Error::new(ProcessError { command, status });
        let mut detail = String::new();
        if let Some(exec) = exec {
            let stdout = exec.stdout.trim();
            let stderr = exec.stderr.trim();
            if !stdout.is_empty() {
                detail.push_str(stdout);
            }
            if !stderr.is_empty() {
                if !detail.is_empty() {
                    detail.push('\n');
                }
                detail.push_str(stderr);
            }
        }
        match (&self.error_msg, detail.is_empty()) {
            (Some(msg), true) => error.context(msg.clone()),
            (Some(msg), false) => error.context(format!("{}\n{}", msg, detail)),
            (None, true) => error,
            (None, false) => error.context(detail),
        }
    }
}

/// Dispatch a pipeline command to the console or to the capture log,
/// depending on whether the run is quiet.
pub fn run_stage_command(cmd: Cmd, capture: Option<&Path>) -> Result<()> {
    match capture {
        Some(log_path) => cmd.run_logged(log_path),
        None => cmd.run_interactive(),
    }
}

/// Write a timestamped run header to the capture log.
pub fn start_capture_log(log_path: &Path) -> Result<()> {
    let now = time::OffsetDateTime::now_utc();
    let stamp = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    );
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening capture log {}", log_path.display()))?;
    writeln!(log, "==== nodec run {} ====", stamp)?;
    Ok(())
}

fn replay_log_section(log_path: &Path, from: u64) {
    // Best effort: the command failure is the error being reported, a
    // replay problem must not mask it.
    let replay = (|| -> std::io::Result<String> {
        let mut file = std::fs::File::open(log_path)?;
        file.seek(SeekFrom::Start(from))?;
        let mut section = String::new();
        file.read_to_string(&mut section)?;
        Ok(section)
    })();
    match replay {
        Ok(section) => eprint!("{}", section),
        Err(err) => eprintln!("(could not replay {}: {})", log_path.display(), err),
    }
}

/// Fail with a clear message when an artifact a tool should have produced
/// is missing.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("{} not found at {}", what, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let exec = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(exec.success());
        assert_eq!(exec.stdout.trim(), "hello");
    }

    #[test]
    fn run_fails_on_nonzero_exit() {
        let err = Cmd::new("false")
            .error_msg("tool check failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("tool check failed"));
        assert!(err.downcast_ref::<ProcessError>().is_some());
    }

    #[test]
    fn allow_fail_returns_exec_on_nonzero_exit() {
        let exec = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!exec.success());
    }

    #[test]
    fn allow_fail_still_errors_when_spawn_fails() {
        let result = Cmd::new("nodec-no-such-binary-xyzzy").allow_fail().run();
        assert!(result.is_err());
    }

    #[test]
    fn run_logged_appends_output_and_preserves_previous_sections() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("capture.log");
        start_capture_log(&log).unwrap();
        Cmd::new("echo").arg("first").run_logged(&log).unwrap();
        Cmd::new("echo").arg("second").run_logged(&log).unwrap();

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.starts_with("==== nodec run "));
        assert!(contents.contains("-> running echo first"));
        assert!(contents.contains("first\n"));
        assert!(contents.contains("second\n"));
    }

    #[test]
    fn run_logged_reports_failure_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("capture.log");
        let err = Cmd::new("false").run_logged(&log).unwrap_err();
        let process = err.downcast_ref::<ProcessError>().unwrap();
        assert!(!process.status.success());
    }

    #[test]
    fn render_joins_program_and_args() {
        let cmd = Cmd::new("mksquashfs").args(["a", "b"]);
        assert_eq!(cmd.render(), "mksquashfs a b");
    }

    #[test]
    fn ensure_exists_names_the_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("out/Release/node");
        let err = ensure_exists(&missing, "compiled runtime").unwrap_err();
        assert!(err.to_string().contains("compiled runtime"));
    }
}
