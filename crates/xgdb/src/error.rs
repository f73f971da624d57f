use thiserror::Error;
use xgdb_engine::EngineError;

/// Debug stub errors.
#[derive(Error, Debug)]
pub enum StubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, StubError>;
