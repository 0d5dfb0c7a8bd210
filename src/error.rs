use thiserror::Error;

/// All errors produced by echoprobe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("reference preload failed: {0}")]
    PreloadFailed(String),

    #[error("stream open error: {0}")]
    StreamOpen(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("invalid PCM layout: {0}")]
    InvalidPcm(String),

    #[error("a test run is already in progress")]
    AlreadyRunning,

    #[error("no test run is in progress")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;
