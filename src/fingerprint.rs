//! Content fingerprint of dependency descriptors
//!
//! A changed fingerprint forces a full rebuild of the isolated services.
//! Descriptors that cannot be read always count as a change, so a missing
//! file errs towards rebuilding.

use crate::error::{DevgateError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the stored fingerprint inside the state directory
pub const FINGERPRINT_FILE: &str = "deps.sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Hex-encoded SHA-256 over descriptor paths and contents
    pub digest: String,
    /// Declared descriptors that could not be read
    pub missing: Vec<PathBuf>,
}

impl Fingerprint {
    /// Hash the declared descriptors in order, relative to the workspace
    pub fn compute(workspace: &Path, files: &[PathBuf]) -> Self {
        let mut hasher = Sha256::new();
        let mut missing = Vec::new();

        for file in files {
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            match fs::read(workspace.join(file)) {
                Ok(content) => {
                    hasher.update((content.len() as u64).to_be_bytes());
                    hasher.update(&content);
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Dependency descriptor unreadable");
                    hasher.update(b"<missing>");
                    missing.push(file.clone());
                }
            }
        }

        Self {
            digest: hex::encode(hasher.finalize()),
            missing,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// True only for a complete fingerprint equal to the stored one
    pub fn matches(&self, stored: Option<&str>) -> bool {
        self.is_complete() && stored == Some(self.digest.as_str())
    }
}

/// Last fingerprint a rebuild was performed for
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    path: PathBuf,
}

impl FingerprintStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(FINGERPRINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored digest, if any. Unreadable state counts as no state.
    pub fn load(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let digest = content.trim().to_string();
                (!digest.is_empty()).then_some(digest)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read stored fingerprint");
                None
            }
        }
    }

    pub fn save(&self, fingerprint: &Fingerprint) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| DevgateError::io(dir, e))?;
        }
        fs::write(&self.path, format!("{}\n", fingerprint.digest))
            .map_err(|e| DevgateError::io(&self.path, e))?;
        debug!(path = %self.path.display(), digest = %fingerprint.digest, "Stored dependency fingerprint");
        Ok(())
    }

    /// Whether the descriptors changed since the last stored fingerprint
    pub fn needs_rebuild(&self, current: &Fingerprint) -> bool {
        !current.matches(self.load().as_deref())
    }
}
