//! # Bootstrap Contact Persistence
//!
//! An ordered list of `(id, endpoint)` records: read when a node joins,
//! rewritten on clean shutdown with the most recently useful peers first.
//! Reads are tolerant — a missing or corrupt file just means joining from
//! caller-supplied endpoints alone.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::id::NodeId;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapContact {
    pub id: NodeId,
    pub endpoint: SocketAddr,
}

pub struct BootstrapFile {
    path: PathBuf,
}

impl BootstrapFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the contact list, best first. Unreadable files yield an empty
    /// list rather than an error.
    pub fn read(&self) -> Vec<BootstrapContact> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!(path = %self.path.display(), "no bootstrap file");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<BootstrapContact>>(&bytes) {
            Ok(contacts) => {
                debug!(
                    path = %self.path.display(),
                    count = contacts.len(),
                    "bootstrap contacts loaded"
                );
                contacts
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "bootstrap file unreadable, ignoring");
                Vec::new()
            }
        }
    }

    /// Rewrite the list, preserving the given order.
    pub fn write(&self, contacts: &[BootstrapContact]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(contacts).context("encoding bootstrap contacts")?;
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("writing {}", self.path.display()))?;
        debug!(
            path = %self.path.display(),
            count = contacts.len(),
            "bootstrap contacts saved"
        );
        Ok(())
    }
}
