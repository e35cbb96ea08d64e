//! Identity of a persistent object.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum IdKey {
    /// Process-unique marker assigned before the real key is known.
    Temporary(u64),
    /// Key-column name to value map.
    Permanent(BTreeMap<String, Value>),
}

/// Identity of one persistent entity instance: entity name plus either a
/// permanent key-column map or a temporary marker assigned before INSERT.
///
/// Two ids are equal iff entity name and key match; the replacement map is
/// excluded from equality. The replacement map accumulates generated and
/// propagated key values during a commit and is shared between clones, so a
/// key generated while batching an insert is visible through every copy of
/// the id. Every temporary id must be resolved to a permanent id by the end
/// of a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
    #[serde(skip, default)]
    replacement: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl ObjectId {
    /// Create a permanent id from a key-column map.
    pub fn new(entity: impl Into<String>, key: BTreeMap<String, Value>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(key),
            replacement: Arc::default(),
        }
    }

    /// Create a permanent id with a single key column.
    pub fn with_single_key(
        entity: impl Into<String>,
        key_column: impl Into<String>,
        value: Value,
    ) -> Self {
        let mut key = BTreeMap::new();
        key.insert(key_column.into(), value);
        Self::new(entity, key)
    }

    /// Create a temporary id for a not-yet-inserted object.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed)),
            replacement: Arc::default(),
        }
    }

    /// Build a permanent id from the primary-key columns of a row.
    ///
    /// Fails with a mapping error when a key column is absent from the row.
    pub fn from_key_columns(
        entity: impl Into<String>,
        key_columns: &[&str],
        get: impl Fn(&str) -> Option<Value>,
    ) -> Result<Self> {
        let entity = entity.into();
        let mut key = BTreeMap::new();
        for column in key_columns {
            let value = get(column).ok_or_else(|| {
                Error::Mapping(format!("snapshot for '{entity}' is missing key column '{column}'"))
            })?;
            key.insert((*column).to_string(), value);
        }
        Ok(Self::new(entity, key))
    }

    /// Entity name this id belongs to.
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    /// Whether the real key is not yet known.
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// Key value for one column of a permanent id.
    pub fn key_value(&self, column: &str) -> Option<Value> {
        match &self.key {
            IdKey::Permanent(key) => key.get(column).cloned(),
            IdKey::Temporary(_) => None,
        }
    }

    /// Key map of a permanent id; empty for temporary ids.
    pub fn key_map(&self) -> BTreeMap<String, Value> {
        match &self.key {
            IdKey::Permanent(key) => key.clone(),
            IdKey::Temporary(_) => BTreeMap::new(),
        }
    }

    /// The single key value, when the id has exactly one key column.
    pub fn single_key_value(&self) -> Option<Value> {
        match &self.key {
            IdKey::Permanent(key) if key.len() == 1 => key.values().next().cloned(),
            _ => None,
        }
    }

    /// Record a generated or propagated key value for one column.
    pub fn attach_replacement(&self, column: impl Into<String>, value: Value) {
        self.replacement.lock().insert(column.into(), value);
    }

    /// Look up a value in the replacement map.
    pub fn replacement_value(&self, column: &str) -> Option<Value> {
        self.replacement.lock().get(column).cloned()
    }

    /// Whether any replacement values have been recorded.
    pub fn is_replacement_needed(&self) -> bool {
        !self.replacement.lock().is_empty()
    }

    /// Key value for a column, consulting the permanent key first and the
    /// replacement map second.
    pub fn effective_value(&self, column: &str) -> Option<Value> {
        self.key_value(column).or_else(|| self.replacement_value(column))
    }

    /// Produce the permanent id this id resolves to after a commit: the
    /// permanent key overlaid with recorded replacement values.
    ///
    /// A temporary id with an empty replacement map cannot be resolved; the
    /// enclosing commit must fail.
    pub fn resolve_replacement(&self) -> Result<ObjectId> {
        let replacement = self.replacement.lock();
        let mut key = self.key_map();
        for (column, value) in replacement.iter() {
            key.insert(column.clone(), value.clone());
        }
        if key.is_empty() {
            return Err(Error::UnresolvedId(format!("{self}")));
        }
        Ok(ObjectId::new(self.entity.clone(), key))
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.key == other.key
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary(n) => write!(f, "{}:temp[{n}]", self.entity),
            IdKey::Permanent(key) => {
                write!(f, "{}:", self.entity)?;
                for (i, (k, v)) in key.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}={v:?}")?;
                }
                Ok(())
            }
        }
    }
}
