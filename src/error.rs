use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdvisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("malformed profile document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("malformed coverage export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`{command}` exited with {status}")]
    Exec { command: String, status: ExitStatus },

    #[error("expected artifact missing: {0}")]
    MissingArtifact(PathBuf),
}

impl AdvisorError {
    pub fn parse(msg: impl Into<String>) -> Self {
        AdvisorError::Parse(msg.into())
    }
}
