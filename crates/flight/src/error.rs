use std::time::Duration;

/// Why a flight could not produce output.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("failed to load module {reference}: {message}")]
    Load { reference: String, message: String },
    #[error("failed to start flight: {0}")]
    Spawn(String),
    #[error("flight timed out after {0:?}")]
    Timeout(Duration),
    #[error("flight exited with {}: {stderr}", .code.map(|c| format!("code {}", c)).unwrap_or_else(|| "a signal".into()))]
    Failed { code: Option<i32>, stderr: String },
    #[error("flight produced no output")]
    EmptyOutput,
    #[error("flight output exceeds {0} bytes")]
    OutputTooLarge(usize),
    #[error("flight io: {0}")]
    Io(#[from] std::io::Error),
}
