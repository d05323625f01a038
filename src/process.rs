use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ToolError;

const REDACTED: &str = "[REDACTED]";

/// An invocation of an external command line tool.
///
/// Output is streamed into `tracing` line by line while the tool runs, with
/// secret arguments masked, and stdout is returned to the caller.
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    program: String,
    args: Vec<String>,
    secrets: Vec<String>,
    stdin: Option<String>,
    current_dir: Option<Utf8PathBuf>,
}

impl Tool {
    /// `name` is used in logs and errors, `program` is what gets executed.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            secrets: Vec::new(),
            stdin: None,
            current_dir: None,
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

    /// Adds an argument that must never show up in logs or errors.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        if !arg.is_empty() {
            self.secrets.push(arg.clone());
        }
        self.args.push(arg);
        self
    }

    /// Text written to the tool's stdin before closing it.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// The command line with secrets masked.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push_str(&format!("{:?}", self.redact(arg)));
            } else {
                line.push_str(&self.redact(arg));
            }
        }
        line
    }

    /// Runs the tool to completion and returns its stdout.
    pub fn output(&self) -> Result<String, ToolError> {
        tracing::debug!("Running {}", self.command_line());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ToolError::Spawn {
            tool: self.name.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            // A tool that exits without reading its input is not an error.
            let _ = pipe.write_all(input.as_bytes());
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout, stderr) = std::thread::scope(|s| {
            let errors = s.spawn(|| self.drain(stderr, tracing::Level::WARN));
            let output = self.drain(stdout, tracing::Level::DEBUG);
            (output, errors.join().unwrap_or_default())
        });

        let status = child.wait().map_err(|source| ToolError::Spawn {
            tool: self.name.clone(),
            source,
        })?;

        if !status.success() {
            if !stderr.trim().is_empty() {
                tracing::error!("{} failed:\n{}", self.name, stderr.trim());
            }
            return Err(ToolError::Exit {
                tool: self.name.clone(),
                code: status.code(),
            });
        }

        Ok(stdout)
    }

    /// Runs the tool to completion, discarding stdout.
    pub fn run(&self) -> Result<(), ToolError> {
        self.output().map(drop)
    }

    fn drain(&self, pipe: Option<impl Read>, level: tracing::Level) -> String {
        let Some(pipe) = pipe else {
            return String::new();
        };

        let mut collected = String::new();
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            let line = self.redact(&line);
            if level == tracing::Level::WARN {
                tracing::warn!("[{}] {}", self.name, line);
            } else {
                tracing::debug!("[{}] {}", self.name, line);
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    }
}
