//! Price selector table — normalized domain → CSS-like locator.
//!
//! Readers take an `Arc<SelectorTable>` snapshot with one atomic load; reload
//! builds a whole new table and swaps the pointer, so a reader sees either the
//! old table or the new one, never a half-updated mapping. In-flight probes
//! keep the snapshot they started with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::{PrcDropError, Result};
use crate::types::normalize_domain;

/// Immutable domain → selector mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectorTable {
    entries: HashMap<String, String>,
}

impl SelectorTable {
    /// Build a table, normalizing every domain key.
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (normalize_domain(k.as_ref()), v.into()))
                .filter(|(_, v): &(String, String)| !v.trim().is_empty())
                .collect(),
        }
    }

    /// Parse the JSON object format: `{"takealot.com": "span.currency"}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, String> = serde_json::from_str(json)?;
        Ok(Self::new(raw))
    }

    /// Read and parse a selector file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PrcDropError::Config(format!("Failed to read selectors {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Selector for an already-normalized domain.
    pub fn get(&self, domain: &str) -> Option<&str> {
        self.entries.get(domain).map(String::as_str)
    }

    pub fn supports(&self, domain: &str) -> bool {
        self.entries.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owned, hot-swappable holder of the current selector table.
pub struct SelectorStore {
    current: ArcSwap<SelectorTable>,
    source: Option<PathBuf>,
}

impl SelectorStore {
    /// Store backed by a JSON file. A missing or broken file at startup is
    /// logged and leaves the table empty; `/status` reports it.
    pub fn from_file(path: &Path) -> Self {
        let table = match SelectorTable::load_from(path) {
            Ok(t) => {
                tracing::info!("🏷️ Loaded {} price selectors from {}", t.len(), path.display());
                t
            }
            Err(e) => {
                tracing::error!("❌ Error loading selectors: {e}");
                SelectorTable::default()
            }
        };
        Self {
            current: ArcSwap::from_pointee(table),
            source: Some(path.to_path_buf()),
        }
    }

    /// Fixed in-memory table with no backing file.
    pub fn fixed(table: SelectorTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
            source: None,
        }
    }

    /// Current table snapshot.
    pub fn snapshot(&self) -> Arc<SelectorTable> {
        self.current.load_full()
    }

    pub fn supports(&self, domain: &str) -> bool {
        self.current.load().supports(domain)
    }

    pub fn is_loaded(&self) -> bool {
        !self.current.load().is_empty()
    }

    /// Re-read the backing file and swap it in. An empty or unparsable table is
    /// rejected and the previous table stays in effect.
    pub fn reload(&self) -> Result<usize> {
        let path = self
            .source
            .as_deref()
            .ok_or_else(|| PrcDropError::Config("selector store has no backing file".into()))?;
        let table = SelectorTable::load_from(path)?;
        self.replace(table)
    }

    /// Swap in a new table unless it is empty.
    pub fn replace(&self, table: SelectorTable) -> Result<usize> {
        if table.is_empty() {
            return Err(PrcDropError::Config("selector table is empty".into()));
        }
        let count = table.len();
        self.current.store(Arc::new(table));
        tracing::info!("🔄 Selectors reloaded ({count} domains)");
        Ok(count)
    }
}
