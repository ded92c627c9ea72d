//! Runs prompts through a local Ollama install.
//!
//! Shells out to the `ollama` CLI rather than speaking HTTP, so experiments
//! measure the same end-to-end path a user gets from `ollama run`. Every
//! query carries a hard deadline; a child that outlives it is killed and
//! reported as a timeout, distinguishable from other failures.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use workload_profiler::WorkError;

/// Deadline for `ollama list` during preflight checks.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum OllamaError {
    #[error("ollama query timed out after {after_secs:.0}s")]
    Timeout { after_secs: f64 },
    #[error("ollama exited with {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },
    #[error("ollama returned an empty response")]
    EmptyResponse,
    #[error("failed to run ollama: {0}")]
    Io(#[from] std::io::Error),
}

impl From<OllamaError> for WorkError {
    fn from(err: OllamaError) -> Self {
        match err {
            OllamaError::Timeout { after_secs } => WorkError::TimedOut { after_secs },
            other => WorkError::Failed {
                kind: other.kind().to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl OllamaError {
    fn kind(&self) -> &'static str {
        match self {
            OllamaError::Timeout { .. } => "Timeout",
            OllamaError::NonZeroExit { .. } => "OllamaExit",
            OllamaError::EmptyResponse => "EmptyResponse",
            OllamaError::Io(_) => "Io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one prompt to completion, killing the child at the deadline.
    ///
    /// Assumes the service and model were preflight-checked at startup;
    /// re-checking per query would add minutes to a batch experiment.
    pub fn generate(&self, prompt: &str) -> Result<String, OllamaError> {
        log::debug!("running '{}' with {:.60}", self.model, prompt);

        let mut child = Command::new("ollama")
            .args(["run", &self.model, prompt])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes on their own threads so a large response can't
        // fill the pipe buffer and deadlock the wait loop.
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let Some(status) = wait_with_deadline(&mut child, self.timeout)? else {
            let _ = child.kill();
            let _ = child.wait();
            log::error!(
                "ollama query timed out after {:.0}s",
                self.timeout.as_secs_f64()
            );
            return Err(OllamaError::Timeout {
                after_secs: self.timeout.as_secs_f64(),
            });
        };

        let stdout = join_pipe(stdout);
        let stderr = join_pipe(stderr);

        if !status.success() {
            return Err(OllamaError::NonZeroExit {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let response = stdout.trim().to_string();
        if response.is_empty() {
            return Err(OllamaError::EmptyResponse);
        }
        log::debug!("ollama responded with {} chars", response.len());
        Ok(response)
    }
}

/// Whether the Ollama service answers at all.
pub fn service_running() -> bool {
    list_models().is_some()
}

/// Whether `model` appears in `ollama list`.
pub fn model_available(model: &str) -> bool {
    list_models().is_some_and(|listing| model_listed(&listing, model))
}

fn list_models() -> Option<String> {
    let mut child = Command::new("ollama")
        .arg("list")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let stdout = drain_pipe(child.stdout.take());

    match wait_with_deadline(&mut child, PREFLIGHT_TIMEOUT) {
        Ok(Some(status)) if status.success() => Some(join_pipe(stdout)),
        Ok(Some(_)) => None,
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            None
        }
    }
}

/// `ollama list` prints a header row, then one model per line with the name
/// (including any tag) in the first column.
fn model_listed(listing: &str, model: &str) -> bool {
    listing.lines().skip(1).any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|name| name == model || name.starts_with(&format!("{model}:")))
    })
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    })
}

fn join_pipe(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
