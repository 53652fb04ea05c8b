//! External tool invocation seam
//!
//! All ipset/iptables/ip invocations go through [`CommandRunner`] so the
//! adapters can be exercised without the real binaries. [`SystemRunner`] is
//! the production implementation; [`mock::ScriptedRunner`] records command
//! lines and plays back scripted outputs for tests.

use std::io;
use std::process::{Output, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs external commands and returns their combined output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<Output>;

    /// Run a command, feeding `input` to its stdin
    async fn run_with_stdin(&self, program: &str, args: &[&str], input: &[u8])
        -> io::Result<Output>;
}

/// Production runner backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a shared system runner
    #[must_use]
    pub fn shared() -> Arc<dyn CommandRunner> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        input: &[u8],
    ) -> io::Result<Output> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
        }

        child.wait_with_output().await
    }
}

/// Render a command line for logs and error messages
#[must_use]
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Combined stdout+stderr of an invocation, trimmed
#[must_use]
pub fn output_text(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.trim().is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text.trim().to_string()
}

/// Scripted runner for adapter tests
pub mod mock {
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{command_line, CommandRunner};

    /// A scripted response matched by substring against the command line
    #[derive(Debug, Clone)]
    pub struct Script {
        /// Substring the command line must contain
        pub needle: String,
        /// Exit code to report
        pub code: i32,
        /// Stdout to report
        pub stdout: String,
    }

    /// Records every command line and answers from a script table.
    ///
    /// Unmatched commands succeed with empty output, which mirrors the happy
    /// path of the real tools.
    #[derive(Debug, Default)]
    pub struct ScriptedRunner {
        scripts: Mutex<Vec<Script>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        /// Create an empty runner (all commands succeed)
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a scripted response; first match wins
        pub fn script(&self, needle: impl Into<String>, code: i32, stdout: impl Into<String>) {
            self.scripts.lock().push(Script {
                needle: needle.into(),
                code,
                stdout: stdout.into(),
            });
        }

        /// All command lines run so far
        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        /// Whether any recorded command line contains the needle
        #[must_use]
        pub fn saw(&self, needle: &str) -> bool {
            self.calls.lock().iter().any(|c| c.contains(needle))
        }

        /// Count of recorded command lines containing the needle
        #[must_use]
        pub fn count(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.contains(needle))
                .count()
        }

        fn respond(&self, line: &str) -> Output {
            let scripts = self.scripts.lock();
            let (code, stdout) = scripts
                .iter()
                .find(|s| line.contains(&s.needle))
                .map_or((0, String::new()), |s| (s.code, s.stdout.clone()));

            Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
            let line = command_line(program, args);
            self.calls.lock().push(line.clone());
            Ok(self.respond(&line))
        }

        async fn run_with_stdin(
            &self,
            program: &str,
            args: &[&str],
            input: &[u8],
        ) -> io::Result<Output> {
            let mut line = command_line(program, args);
            line.push_str(" <<< ");
            line.push_str(&String::from_utf8_lossy(input));
            self.calls.lock().push(line.clone());
            Ok(self.respond(&line))
        }
    }
}
