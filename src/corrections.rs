//! Curated manual overrides for rows no automatic pass could match.
//!
//! The table is a JSON array of `{"name": ..., "fields": {...}}` entries.
//! Names are compared after [`normalize_name`], so case and spacing do not
//! matter.

use crate::error::{Result, SynthecaError};
use crate::normalize::normalize_name;
use crate::record::Fields;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub name: String,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Clone, Default)]
pub struct CorrectionTable {
    entries: HashMap<String, Fields>,
}

impl CorrectionTable {
    pub fn new(corrections: impl IntoIterator<Item = Correction>) -> Self {
        let mut entries = HashMap::new();
        for c in corrections {
            match normalize_name(&c.name) {
                Some(key) => {
                    entries.entry(key).or_insert(c.fields);
                }
                None => warn!("Skipping correction with blank name"),
            }
        }
        Self { entries }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let corrections: Vec<Correction> = serde_json::from_str(raw)
            .map_err(|e| SynthecaError::Parse(format!("Invalid corrections table: {}", e)))?;
        Ok(Self::new(corrections))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let table = Self::from_json(&raw)?;
        info!(path = %path.display(), entries = table.len(), "Loaded corrections");
        Ok(table)
    }

    /// Load `path` if given. A missing file yields an empty table.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                warn!(path = %p.display(), "Corrections file not found, continuing without");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Fields> {
        self.entries.get(&normalize_name(name)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
