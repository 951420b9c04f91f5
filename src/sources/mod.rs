//! Read-only inputs maintained by an external downloader: subnet lists,
//! the virtual host descriptor and the location-name table.

pub mod locations;
pub mod subnets;
pub mod vhost;

use crate::types::AddressFamily;
use std::path::{Path, PathBuf};

pub const VHOST_FILE: &str = "url.txt";
pub const LOCATIONS_FILE: &str = "colo.txt";

/// Directory holding the data files.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subnets(&self, family: AddressFamily) -> PathBuf {
        self.root.join(family.list_file())
    }

    pub fn vhost(&self) -> PathBuf {
        self.root.join(VHOST_FILE)
    }

    pub fn locations(&self) -> PathBuf {
        self.root.join(LOCATIONS_FILE)
    }

    /// Files a search cannot start without. The location table is optional.
    pub fn missing_required(&self, family: AddressFamily) -> Vec<PathBuf> {
        [self.subnets(family), self.vhost()]
            .into_iter()
            .filter(|p| !p.exists())
            .collect()
    }
}
