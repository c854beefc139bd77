//! Protocol lockfile
//!
//! Records the envelope schema version and every registered handler
//! protocol with its method signatures. CI compares a freshly generated
//! lockfile against the committed one; an incompatible change without a
//! major version bump fails the comparison.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::SemVer;
use crate::envelope::ENVELOPE_SCHEMA_VERSION;
use crate::error::{HostError, Result};
use crate::handler::{HandlerRegistry, ProtocolDescriptor};

pub const LOCKFILE_NAME: &str = "protocols.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolLockfile {
    pub envelope_schema_version: String,
    #[serde(default)]
    pub protocols: BTreeMap<String, ProtocolDescriptor>,
}

/// One difference between a locked and a current lockfile
#[derive(Debug, Clone, PartialEq)]
pub enum LockfileChange {
    EnvelopeSchemaChanged { locked: String, current: String },
    ProtocolAdded { protocol: String },
    ProtocolRemoved { protocol: String },
    MethodAdded { protocol: String, method: String },
    MethodRemoved { protocol: String, method: String },
    MethodChanged { protocol: String, method: String },
    VersionChanged { protocol: String, locked: String, current: String },
}

impl fmt::Display for LockfileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnvelopeSchemaChanged { locked, current } => {
                write!(f, "envelope schema {} -> {}", locked, current)
            }
            Self::ProtocolAdded { protocol } => write!(f, "protocol {} added", protocol),
            Self::ProtocolRemoved { protocol } => write!(f, "protocol {} removed", protocol),
            Self::MethodAdded { protocol, method } => write!(f, "{}.{} added", protocol, method),
            Self::MethodRemoved { protocol, method } => write!(f, "{}.{} removed", protocol, method),
            Self::MethodChanged { protocol, method } => {
                write!(f, "{}.{} signature changed", protocol, method)
            }
            Self::VersionChanged {
                protocol,
                locked,
                current,
            } => write!(f, "{} version {} -> {}", protocol, locked, current),
        }
    }
}

/// Result of comparing a committed lockfile with the current registry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockfileComparison {
    /// Compatible changes; the lockfile should be regenerated
    pub compatible: Vec<LockfileChange>,
    /// Incompatible changes without a major bump
    pub incompatible: Vec<LockfileChange>,
}

impl LockfileComparison {
    pub fn is_clean(&self) -> bool {
        self.compatible.is_empty() && self.incompatible.is_empty()
    }
}

fn major_of(version: &str) -> Option<u64> {
    version.parse::<SemVer>().ok().map(|v| v.major)
}

impl ProtocolLockfile {
    /// Snapshot of the registry's protocols
    pub fn generate(registry: &HandlerRegistry) -> Self {
        Self {
            envelope_schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            protocols: registry.protocols(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HostError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Classify every difference from `self` (locked) to `current`
    pub fn compare(&self, current: &ProtocolLockfile) -> LockfileComparison {
        let mut result = LockfileComparison::default();

        if self.envelope_schema_version != current.envelope_schema_version {
            let change = LockfileChange::EnvelopeSchemaChanged {
                locked: self.envelope_schema_version.clone(),
                current: current.envelope_schema_version.clone(),
            };
            // The envelope is frozen: any major change breaks every producer
            if major_of(&self.envelope_schema_version) == major_of(&current.envelope_schema_version) {
                result.compatible.push(change);
            } else {
                result.incompatible.push(change);
            }
        }

        for (name, locked) in &self.protocols {
            let Some(now) = current.protocols.get(name) else {
                result.incompatible.push(LockfileChange::ProtocolRemoved {
                    protocol: name.clone(),
                });
                continue;
            };
            let bumped = match (major_of(&locked.version), major_of(&now.version)) {
                (Some(old), Some(new)) => new > old,
                _ => false,
            };

            let mut breaking = Vec::new();
            for (method, signature) in &locked.methods {
                match now.methods.get(method) {
                    None => breaking.push(LockfileChange::MethodRemoved {
                        protocol: name.clone(),
                        method: method.clone(),
                    }),
                    Some(sig) if sig != signature => breaking.push(LockfileChange::MethodChanged {
                        protocol: name.clone(),
                        method: method.clone(),
                    }),
                    Some(_) => {}
                }
            }
            for method in now.methods.keys().filter(|m| !locked.methods.contains_key(*m)) {
                result.compatible.push(LockfileChange::MethodAdded {
                    protocol: name.clone(),
                    method: method.clone(),
                });
            }
            if locked.version != now.version {
                result.compatible.push(LockfileChange::VersionChanged {
                    protocol: name.clone(),
                    locked: locked.version.clone(),
                    current: now.version.clone(),
                });
            }

            if bumped {
                result.compatible.extend(breaking);
            } else {
                result.incompatible.extend(breaking);
            }
        }

        for name in current.protocols.keys().filter(|n| !self.protocols.contains_key(*n)) {
            result.compatible.push(LockfileChange::ProtocolAdded {
                protocol: name.clone(),
            });
        }
        result
    }

    /// Fail on incompatible drift
    pub fn check(&self, current: &ProtocolLockfile) -> Result<LockfileComparison> {
        let comparison = self.compare(current);
        if !comparison.incompatible.is_empty() {
            return Err(HostError::LockfileDrift {
                changes: comparison.incompatible.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(comparison)
    }
}
