//! Contract store
//!
//! Owns every loaded `NodeMetadata`. Loading is idempotent per fingerprint;
//! changing a contract requires a version bump and an explicit `reload`.
//! The store is frozen once the host is RUNNING.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Contract, NodeMetadata};
use crate::error::{HostError, Result};

/// What a load did
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(Arc<NodeMetadata>),
    /// Same fingerprint as the stored contract; nothing changed
    Unchanged(Arc<NodeMetadata>),
    /// Version bump accepted through `reload`
    Replaced {
        previous_fingerprint: String,
        current: Arc<NodeMetadata>,
    },
}

impl LoadOutcome {
    pub fn metadata(&self) -> &Arc<NodeMetadata> {
        match self {
            LoadOutcome::Loaded(meta) | LoadOutcome::Unchanged(meta) => meta,
            LoadOutcome::Replaced { current, .. } => current,
        }
    }
}

/// Loaded contracts keyed by node_id
#[derive(Debug, Default)]
pub struct ContractStore {
    nodes: BTreeMap<String, Arc<NodeMetadata>>,
    strict_fingerprints: bool,
    frozen: bool,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject contracts that do not declare their fingerprint
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_fingerprints = strict;
        self
    }

    /// Parse and validate one document without storing it
    pub fn parse(&self, text: &str, origin: &str) -> Result<NodeMetadata> {
        let contract = Contract::from_yaml(text).map_err(|e| match e {
            HostError::ContractValidation { reason, .. } => HostError::ContractValidation {
                node_id: origin.to_string(),
                reason,
            },
            other => other,
        })?;
        if self.strict_fingerprints && contract.fingerprint.is_none() {
            return Err(HostError::contract(
                &contract.node_id,
                format!("fingerprint must be declared (computed {})", contract.compute_fingerprint()?),
            ));
        }
        NodeMetadata::from_contract(contract)
    }

    pub fn load_str(&mut self, text: &str) -> Result<LoadOutcome> {
        let meta = self.parse(text, "<inline>")?;
        self.insert(meta, false)
    }

    /// Load a new version of an already loaded contract
    pub fn reload_str(&mut self, text: &str) -> Result<LoadOutcome> {
        let meta = self.parse(text, "<inline>")?;
        self.insert(meta, true)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<LoadOutcome> {
        let meta = self.parse_file(path)?;
        self.insert(meta, false)
    }

    pub fn reload_file(&mut self, path: &Path) -> Result<LoadOutcome> {
        let meta = self.parse_file(path)?;
        self.insert(meta, true)
    }

    /// Load every `*.yaml` / `*.yml` in `dir`, in file name order
    ///
    /// Two files declaring the same node_id in one batch is an error even
    /// when their fingerprints agree.
    pub fn load_dir(&mut self, dir: &Path) -> Result<Vec<LoadOutcome>> {
        let files = contract_files(dir)?;
        let mut batch = Vec::with_capacity(files.len());
        let mut seen = HashSet::new();
        for path in &files {
            let meta = self.parse_file(path)?;
            if !seen.insert(meta.node_id().to_string()) {
                return Err(HostError::contract(
                    meta.node_id(),
                    format!("declared again in {}", path.display()),
                ));
            }
            batch.push(meta);
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        for meta in batch {
            outcomes.push(self.insert(meta, false)?);
        }
        tracing::info!(dir = %dir.display(), contracts = outcomes.len(), "loaded contract directory");
        Ok(outcomes)
    }

    /// Store validated metadata
    pub fn insert(&mut self, meta: NodeMetadata, allow_replace: bool) -> Result<LoadOutcome> {
        if self.frozen {
            return Err(HostError::StoreFrozen {
                node_id: meta.node_id().to_string(),
            });
        }

        let node_id = meta.node_id().to_string();
        let Some(existing) = self.nodes.get(&node_id) else {
            let meta = Arc::new(meta);
            tracing::debug!(%node_id, fingerprint = %meta.fingerprint(), "contract loaded");
            self.nodes.insert(node_id, meta.clone());
            return Ok(LoadOutcome::Loaded(meta));
        };

        if existing.fingerprint() == meta.fingerprint() {
            return Ok(LoadOutcome::Unchanged(existing.clone()));
        }
        let (from, to) = (existing.semver()?, meta.semver()?);
        match to.cmp(&from) {
            Ordering::Greater => {}
            Ordering::Equal => {
                return Err(HostError::contract(
                    &node_id,
                    format!(
                        "structure changed without a version bump ({} -> {})",
                        existing.fingerprint(),
                        meta.fingerprint()
                    ),
                ))
            }
            Ordering::Less => {
                return Err(HostError::contract(
                    &node_id,
                    format!("version {} does not supersede loaded version {}", to, from),
                ))
            }
        }
        if !allow_replace {
            return Err(HostError::DuplicateNodeId {
                node_id,
                existing_version: existing.version().to_string(),
            });
        }

        let previous_fingerprint = existing.fingerprint().to_string();
        let current = Arc::new(meta);
        tracing::info!(
            %node_id,
            from = %previous_fingerprint,
            to = %current.fingerprint(),
            "contract replaced"
        );
        self.nodes.insert(node_id, current.clone());
        Ok(LoadOutcome::Replaced {
            previous_fingerprint,
            current,
        })
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeMetadata>> {
        self.nodes.get(node_id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<NodeMetadata>> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn parse_file(&self, path: &Path) -> Result<NodeMetadata> {
        if !path.exists() {
            return Err(HostError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        self.parse(&text, &path.display().to_string())
    }
}

fn contract_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(HostError::FileNotFound {
            path: dir.to_path_buf(),
        });
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    files.sort();
    Ok(files)
}
