use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to spawn server `{path}`: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server at {url} never became healthy ({attempts} probes)")]
    HealthCheckTimeout { url: String, attempts: u32 },

    #[error("teardown step `{step}` failed: {source}")]
    Teardown {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("load tool `{tool}` is not available on this host")]
    MissingLoadTool { tool: String },

    #[error("server binary `{0}` does not exist")]
    MissingServerBin(PathBuf),

    #[error("invalid matrix file `{path}`: {source}")]
    Matrix {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no configuration produced a recorded result")]
    NoResults,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
