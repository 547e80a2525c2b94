//! External tool invocation.
//!
//! Every tool call goes through [`Cmd`], a small argument-vector builder, and is
//! executed by a [`ToolRunner`]. Production code uses [`HostRunner`]; tests swap
//! in a fake runner that records the argument vectors and fabricates outputs.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// A command line for an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin_file: Option<PathBuf>,
    stdout_file: Option<PathBuf>,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
}

/// Captured result of a finished tool.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
            stdout_file: None,
            current_dir: None,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// Feed the contents of `path` to the tool's stdin.
    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin_file = Some(path.to_path_buf());
        self
    }

    /// Redirect the tool's stdout into `path`.
    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout_file = Some(path.to_path_buf());
        self
    }

    /// Run the tool from `dir` instead of the caller's working directory.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Message used when the tool exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_file(&self) -> Option<&Path> {
        self.stdin_file.as_deref()
    }

    pub fn stdout_file(&self) -> Option<&Path> {
        self.stdout_file.as_deref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Run the command and fail unless it exits 0.
    pub fn run_with(&self, runner: &dyn ToolRunner) -> Result<CommandResult> {
        debug!(command = %self, "running tool");
        let result = runner.execute(self)?;
        if result.success() {
            return Ok(result);
        }

        let msg = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("{} failed", self.program));
        let status = match result.status {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = result.stderr.trim();
        if stderr.is_empty() {
            bail!("{msg} ({status})");
        }
        bail!("{msg} ({status}):\n{stderr}")
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Executes a [`Cmd`] and reports how it finished.
///
/// Implementations only execute; exit-status policy lives in [`Cmd::run_with`].
pub trait ToolRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult>;
}

/// Runs tools on the host, resolving the program through `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl ToolRunner for HostRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        let program = which::which(cmd.program()).with_context(|| {
            format!(
                "cannot find tool '{}' (install it or point the matching environment variable at it)",
                cmd.program()
            )
        })?;

        let mut command = Command::new(&program);
        command.args(cmd.get_args());
        if let Some(dir) = cmd.working_dir() {
            command.current_dir(dir);
        }

        if let Some(path) = cmd.stdin_file() {
            let input = File::open(path)
                .with_context(|| format!("opening stdin file '{}'", path.display()))?;
            command.stdin(Stdio::from(input));
        } else {
            command.stdin(Stdio::null());
        }

        if let Some(path) = cmd.stdout_file() {
            let out = File::create(path)
                .with_context(|| format!("creating stdout file '{}'", path.display()))?;
            command.stdout(Stdio::from(out));
        }

        let output = command
            .output()
            .with_context(|| format!("running '{}'", program.display()))?;

        Ok(CommandResult {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    type Handler = Box<dyn Fn(&Cmd) -> Result<CommandResult>>;

    /// Records every command and answers with `handler`.
    pub(crate) struct FakeRunner {
        calls: RefCell<Vec<Cmd>>,
        handler: Handler,
    }

    impl FakeRunner {
        pub(crate) fn new(handler: impl Fn(&Cmd) -> Result<CommandResult> + 'static) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                handler: Box::new(handler),
            }
        }

        pub(crate) fn succeeding() -> Self {
            Self::new(|_| Ok(exit(0)))
        }

        pub(crate) fn calls(&self) -> Vec<Cmd> {
            self.calls.borrow().clone()
        }

        pub(crate) fn calls_to(&self, program: &str) -> Vec<Cmd> {
            self.calls
                .borrow()
                .iter()
                .filter(|cmd| cmd.program() == program)
                .cloned()
                .collect()
        }
    }

    impl ToolRunner for FakeRunner {
        fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
            self.calls.borrow_mut().push(cmd.clone());
            (self.handler)(cmd)
        }
    }

    pub(crate) fn exit(code: i32) -> CommandResult {
        CommandResult {
            status: Some(code),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{exit, FakeRunner};
    use super::*;

    #[test]
    fn test_builder_collects_argv() {
        let cmd = Cmd::new("avbtool")
            .arg("make_vbmeta_image")
            .args(["--output", "out.img"])
            .arg_path(Path::new("/tmp/boot.img"));

        assert_eq!(cmd.program(), "avbtool");
        assert_eq!(
            cmd.get_args(),
            ["make_vbmeta_image", "--output", "out.img", "/tmp/boot.img"]
        );
        assert_eq!(
            cmd.to_string(),
            "avbtool make_vbmeta_image --output out.img /tmp/boot.img"
        );
    }

    #[test]
    fn test_nonzero_exit_is_fatal_with_message() {
        let runner = FakeRunner::new(|_| {
            Ok(CommandResult {
                status: Some(3),
                stderr: "bad table".into(),
                ..Default::default()
            })
        });
        let err = Cmd::new("bpttool")
            .error_msg("bpttool make_table failed")
            .run_with(&runner)
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("bpttool make_table failed"));
        assert!(msg.contains("exit status 3"));
        assert!(msg.contains("bad table"));
    }

    #[test]
    fn test_zero_exit_returns_captured_output() {
        let runner = FakeRunner::new(|_| {
            let mut result = exit(0);
            result.stdout = "1.0\n".into();
            Ok(result)
        });
        let result = Cmd::new("avbtool").arg("version").run_with(&runner).unwrap();
        assert_eq!(result.stdout, "1.0\n");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_host_runner_reports_missing_tool() {
        let err = HostRunner
            .execute(&Cmd::new("definitely_not_a_real_command_12345"))
            .unwrap_err();
        assert!(err.to_string().contains("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_host_runner_redirects_stdout() {
        let temp = tempfile::TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let result = Cmd::new("echo")
            .arg("hello")
            .stdout_to(&out)
            .run_with(&HostRunner)
            .unwrap();

        assert!(result.success());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    }
}
