use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hangar_core::{ReleaseRef, Source};
use metrics::histogram;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{EvalError, Module};

/// Stderr kept for error reports.
const STDERR_CAP: u64 = 64 << 10;

/// Env var carrying the release name into a flight.
pub const ENV_RELEASE: &str = "HANGAR_RELEASE";
/// Env var carrying the release namespace into a flight.
pub const ENV_NAMESPACE: &str = "HANGAR_NAMESPACE";

/// One invocation of a module.
#[derive(Debug, Clone)]
pub struct Flight {
    pub module: Arc<Module>,
    pub release: ReleaseRef,
    /// Bytes passed on stdin, usually the JSON of the triggering object.
    pub input: Vec<u8>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Flight {
    pub fn new(module: Arc<Module>, release: ReleaseRef) -> Self {
        Self { module, release, input: Vec::new(), args: Vec::new(), env: Vec::new() }
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Raw flight output plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub output: Vec<u8>,
    pub source: Source,
}

/// Turns a flight into a resource document. Implementations must not touch the cluster.
#[async_trait::async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, flight: &Flight) -> Result<Evaluation, EvalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalConfig {
    /// `None` runs without a deadline.
    pub timeout: Option<Duration>,
    pub max_output_bytes: usize,
}

impl Default for EvalConfig {
    fn default() -> Self { Self { timeout: Some(Duration::from_secs(10)), max_output_bytes: 64 << 20 } }
}

/// Runs a module as a child process: input on stdin, document on stdout.
/// The child is killed when the deadline passes.
#[derive(Debug, Clone, Default)]
pub struct ProcessEvaluator {
    config: EvalConfig,
}

impl ProcessEvaluator {
    pub fn new(config: EvalConfig) -> Self { Self { config } }

    pub fn config(&self) -> EvalConfig { self.config }

    async fn run(&self, flight: &Flight) -> Result<Vec<u8>, EvalError> {
        let mut child = Command::new(&flight.module.path)
            .args(&flight.args)
            .env(ENV_RELEASE, &flight.release.name)
            .env(ENV_NAMESPACE, &flight.release.namespace)
            .envs(flight.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EvalError::Spawn(format!("{}: {}", flight.module.path.display(), e)))?;

        // stdin is written concurrently with draining stdout and stderr.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = flight.input.clone();
            tokio::spawn(async move {
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            })
        });

        let cap = self.config.max_output_bytes;
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                err.take(STDERR_CAP).read_to_end(&mut buf).await.map(|_| buf)
            })
        });
        let mut stdout = Vec::new();
        if let Some(out) = child.stdout.take() {
            out.take(cap as u64 + 1).read_to_end(&mut stdout).await?;
        }
        if stdout.len() > cap {
            warn!(module = %flight.module.reference, cap, "flight output over limit; killing");
            child.kill().await?;
            return Err(EvalError::OutputTooLarge(cap));
        }

        let status = child.wait().await?;
        if let Some(writer) = writer {
            writer.await.map_err(|e| EvalError::Spawn(format!("stdin writer: {}", e)))??;
        }
        let stderr = match stderr {
            Some(task) => task.await.map_err(|e| EvalError::Spawn(format!("stderr reader: {}", e)))??,
            None => Vec::new(),
        };
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        if !status.success() {
            return Err(EvalError::Failed { code: status.code(), stderr });
        }
        if !stderr.is_empty() {
            debug!(module = %flight.module.reference, stderr = %stderr, "flight stderr");
        }
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(EvalError::EmptyOutput);
        }
        Ok(stdout)
    }
}

#[async_trait::async_trait]
impl Evaluator for ProcessEvaluator {
    async fn evaluate(&self, flight: &Flight) -> Result<Evaluation, EvalError> {
        let started = Instant::now();
        let result = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(flight)).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(module = %flight.module.reference, timeout = ?limit, "flight timed out");
                    Err(EvalError::Timeout(limit))
                }
            },
            None => self.run(flight).await,
        };
        histogram!("flight_eval_ms", started.elapsed().as_secs_f64() * 1000.0);
        let output = result?;
        debug!(module = %flight.module.reference, bytes = output.len(), "flight evaluated");
        Ok(Evaluation { output, source: flight.module.source() })
    }
}
