/// Result alias that carries the custom [`EchoError`] type.
pub type Result<T> = std::result::Result<T, EchoError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    /// Free-form failure that does not fit one of the subsystem variants.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration files that could not be parsed.
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// Failure reported by the FFT backend of the spectrum probe.
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
    /// Caller supplied data that violates a documented precondition.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Camera could not be opened or configured.
    #[error("camera error: {0}")]
    Camera(String),
    /// The image-analysis routine could not produce a distance.
    #[error("analysis failed: {0}")]
    Analysis(String),
    /// The audio output device rejected a command or a write.
    #[error("audio device error: {0}")]
    AudioDevice(String),
    /// A mailbox or worker has already been shut down.
    #[error("{0} has been shut down")]
    Closed(&'static str),
    /// A blocking wait was interrupted before it produced a value.
    #[error("wait interrupted")]
    Interrupted,
}

impl EchoError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for EchoError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for EchoError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
