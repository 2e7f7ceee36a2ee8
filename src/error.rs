use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("daemon error: {0}")]
    Daemon(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid volume '{spec}': {reason}")]
    InvalidVolume { spec: String, reason: String },

    #[error("named volume '{0}' does not exist on the daemon")]
    NamedVolumeMissing(String),

    #[error("failed to pull image '{reference}': {reason}")]
    Pull { reference: String, reason: String },

    #[error("image build failed: {0}")]
    Build(String),

    #[error("failed to push '{tag}': {reason}")]
    Push { tag: String, reason: String },

    #[error("registry credentials error: {0}")]
    Credentials(String),

    #[error("command '{command}' in container {container} exited with code {code}")]
    CommandFailed {
        container: String,
        command: String,
        code: i64,
    },

    #[error("container {container} exited with code {code}")]
    ContainerExited { container: String, code: i64 },

    #[error("host command '{command}' exited with code {code}")]
    HostCommandFailed { command: String, code: i32 },

    #[error("session error: {0}")]
    Session(String),

    #[error("stream error: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
