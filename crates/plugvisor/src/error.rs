#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The executable could not be started.
    Spawn(String),
    /// A stdio pipe that was requested is missing on the child handle.
    MissingPipe(&'static str),
    /// The pulse channel could not be written.
    Pulse(String),
    /// The monitor task panicked or was cancelled.
    Join(String),
    /// The monitored side did not finish within the stop timeout.
    StopTimeout,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(msg) => write!(f, "Failed to spawn process: {}", msg),
            Self::MissingPipe(name) => write!(f, "Child has no {} pipe", name),
            Self::Pulse(msg) => write!(f, "Pulse channel error: {}", msg),
            Self::Join(msg) => write!(f, "Monitor task failed: {}", msg),
            Self::StopTimeout => write!(f, "Monitored side did not stop in time"),
        }
    }
}

impl std::error::Error for Error {}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
