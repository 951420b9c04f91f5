use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{AddressFamily, EndpointStatus};

#[derive(Error, Debug)]
pub enum ScoutError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("System time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot read {path:?}: {source}")]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot open result store {path:?}: {source}")]
    Store {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No usable {family} subnets")]
    NoSubnets { family: AddressFamily },

    #[error("Illegal status transition for {address}: {from} -> {to}")]
    IllegalTransition {
        address: IpAddr,
        from: EndpointStatus,
        to: EndpointStatus,
    },

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, ScoutError>;
