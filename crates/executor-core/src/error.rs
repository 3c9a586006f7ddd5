use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Kubernetes API error: {0}")]
    Kubernetes(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
