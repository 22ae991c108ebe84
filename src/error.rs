//! Error types for AuraSonic

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuraSonicError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Scene error: {0}")]
    Scene(String),

    #[error("Layout error: {0}")]
    Layout(String),

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, AuraSonicError>;
