use crate::error::{Result, ScoutError};
use std::fmt;
use std::path::Path;
use tokio::fs;

/// The domain sent to every probed address, and the resource streamed by the
/// throughput probe. Read from a `hostname/path` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub host: String,
    pub path: String,
}

impl VirtualHost {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let line = descriptor
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| ScoutError::InvalidConfig("virtual host descriptor is empty".to_string()))?;

        // Tolerate a scheme prefix, the descriptor is sometimes copied from a browser
        let line = line
            .trim_start_matches("https://")
            .trim_start_matches("http://");

        let (host, path) = match line.split_once('/') {
            Some((h, p)) => (h, p),
            None => (line, ""),
        };
        if host.is_empty() {
            return Err(ScoutError::InvalidConfig(format!(
                "virtual host descriptor has no hostname: {:?}",
                line
            )));
        }
        Ok(Self {
            host: host.to_string(),
            path: path.trim_start_matches('/').to_string(),
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ScoutError::Input {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content)
    }
}

impl fmt::Display for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.path)
    }
}
