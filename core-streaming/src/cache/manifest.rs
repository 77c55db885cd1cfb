//! On-disk manifest format.

use super::entry::CacheEntry;
use crate::error::{Result, StreamingError};
use serde::{Deserialize, Serialize};

pub(crate) const MANIFEST_FILE: &str = "manifest.json";
pub(crate) const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<CacheEntry>,
}

impl Manifest {
    pub(crate) fn new(entries: Vec<CacheEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries,
        }
    }

    pub(crate) fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| StreamingError::Storage(format!("corrupt cache manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StreamingError::Storage(format!(
                "unsupported cache manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    pub(crate) fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StreamingError::Storage(format!("failed to encode cache manifest: {e}")))
    }
}
