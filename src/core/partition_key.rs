//! Logical partition keys and their effective (hashed or normalized) form.
//!
//! Effective keys are what partition key range boundaries are expressed in;
//! locating a document means computing its effective key and finding the
//! range that contains it.

use super::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::fmt;

const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;
const COMPONENT_SEPARATOR: u8 = 0xff;
const RANGE_COMPONENT_SEPARATOR: char = '\u{1}';

/// A point of the effective-key space. `Min` sorts below every key and `Max`
/// above every key, so `[Min, Max)` is the whole space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EffectiveKey {
    Min,
    Key(String),
    Max,
}

impl From<&str> for EffectiveKey {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<String> for EffectiveKey {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl fmt::Display for EffectiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Min => write!(f, "<min>"),
            Self::Key(key) => write!(f, "\"{}\"", key),
            Self::Max => write!(f, "<max>"),
        }
    }
}

/// How logical keys are mapped onto the effective-key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKind {
    /// Keys are hashed; ranges split the hash space.
    Hash,
    /// Keys keep their natural order; ranges split the key space itself.
    Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyDefinition {
    pub paths: Vec<String>,
    pub kind: PartitionKind,
}

impl PartitionKeyDefinition {
    pub fn new(paths: Vec<String>, kind: PartitionKind) -> Result<Self> {
        let definition = Self { paths, kind };
        definition.validate()?;
        Ok(definition)
    }

    /// Single-path hash definition, the common case.
    pub fn hash(path: impl Into<String>) -> Result<Self> {
        Self::new(vec![path.into()], PartitionKind::Hash)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(RoutingError::InvalidRequest(
                "partition key definition must have at least one path".to_string(),
            ));
        }
        for path in &self.paths {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(RoutingError::InvalidRequest(format!(
                    "partition key path '{}' must start with '/' and name a property",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Computes the effective key of `key` under this definition.
    pub fn effective_key(&self, key: &PartitionKey) -> Result<EffectiveKey> {
        if key.components().len() != self.paths.len() {
            return Err(RoutingError::InvalidRequest(format!(
                "partition key has {} components but the collection defines {} paths",
                key.components().len(),
                self.paths.len()
            )));
        }
        let effective = match self.kind {
            PartitionKind::Hash => format!("{:016x}", hash_components(key.components())),
            PartitionKind::Range => key
                .components()
                .iter()
                .map(PartitionKeyComponent::canonical_string)
                .collect::<Vec<_>>()
                .join(&RANGE_COMPONENT_SEPARATOR.to_string()),
        };
        Ok(EffectiveKey::Key(effective))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionKeyComponent {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl PartitionKeyComponent {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Null => 0x01,
            Self::Bool(false) => 0x02,
            Self::Bool(true) => 0x03,
            Self::Number(_) => 0x05,
            Self::String(_) => 0x08,
        }
    }

    fn canonical_string(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Number(value) => value.to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Null => "null".to_string(),
        }
    }
}

/// A logical partition key value, one component per definition path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionKey(Vec<PartitionKeyComponent>);

impl PartitionKey {
    pub fn new(components: Vec<PartitionKeyComponent>) -> Self {
        Self(components)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self(vec![PartitionKeyComponent::String(value.into())])
    }

    pub fn number(value: f64) -> Self {
        Self(vec![PartitionKeyComponent::Number(value)])
    }

    pub fn components(&self) -> &[PartitionKeyComponent] {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

/// FNV-1a over the type-tagged encoding of every component.
fn hash_components(components: &[PartitionKeyComponent]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut feed = |byte: u8| {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    };
    for (index, component) in components.iter().enumerate() {
        if index > 0 {
            feed(COMPONENT_SEPARATOR);
        }
        feed(component.type_tag());
        match component {
            PartitionKeyComponent::String(value) => value.bytes().for_each(&mut feed),
            PartitionKeyComponent::Number(value) => {
                value.to_be_bytes().into_iter().for_each(&mut feed)
            }
            PartitionKeyComponent::Bool(_) | PartitionKeyComponent::Null => {}
        }
    }
    hash
}
