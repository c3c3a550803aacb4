//! Node assembly errors.

use std::path::PathBuf;

use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport: {0}")]
    Transport(#[from] slotmesh_transport::TransportError),

    #[error("reading config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("channel name {0:?} is used more than once")]
    DuplicateChannel(String),

    #[error("encoding {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },
}
