//! Execution wrapper for the external tools keyescrow drives (`cryptsetup`, `kinit`, `kdestroy`).
//!
//! Process spawning, stdin hand-off, and timeouts live here so each provider only deals with
//! arguments and diagnostics.

use crate::error::{ErrorKind, EscrowError, EscrowResult};
use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// A resolved binary plus the time budget for each invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    binary: PathBuf,
    timeout: Duration,
    envs: Vec<(OsString, OsString)>,
}

/// Captured result of one tool invocation.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Most useful human-readable output: stderr when present, otherwise stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            "no additional output".to_string()
        }
    }
}

impl ToolCommand {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            timeout,
            envs: Vec::new(),
        }
    }

    /// Set an environment variable for every invocation of this command.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the tool with `args`, writing `input` to its stdin when provided.
    ///
    /// Non-zero exits are returned as output, not errors; only spawn failures and timeouts fail.
    pub fn run<S: AsRef<OsStr>>(&self, args: &[S], input: Option<&[u8]>) -> EscrowResult<ToolOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            EscrowError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to launch {}: {err}", self.binary.display()),
            ))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // The tool may exit before draining stdin; its exit status carries the reason.
                match stdin.write_all(payload).and_then(|_| stdin.flush()) {
                    Ok(()) => {}
                    Err(err) if err.kind() == IoErrorKind::BrokenPipe => {}
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EscrowError::Io(err));
                    }
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> EscrowResult<ToolOutput> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EscrowError::Timeout {
                tool: self.binary.display().to_string(),
                after: self.timeout,
                kind: ErrorKind::Io,
            });
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| std::io::Error::other("stdout reader thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| std::io::Error::other("stderr reader thread panicked"))??;

        Ok(ToolOutput {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<EscrowResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> EscrowResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

/// Locate `name`: an explicit `configured` path wins, then `well_known` locations, then `PATH`.
pub fn resolve_binary(
    name: &str,
    configured: Option<&str>,
    well_known: &[&str],
) -> EscrowResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(EscrowError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in well_known {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    find_in_path(name).ok_or_else(|| {
        EscrowError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {well_known:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file().then_some(candidate)
    })
}
