//! In-memory attribute store

use super::AttributeStore;
use crate::{EntityId, KvValue, Result, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Attribute scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeScope {
    ClientScope,
    ServerScope,
    SharedScope,
}

/// A stored attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeKv {
    pub entity_id: EntityId,
    pub scope: AttributeScope,
    pub key: String,
    pub value: KvValue,
    pub last_update_ts: Timestamp,
}

type AttributeSlot = (EntityId, AttributeScope, String);

/// In-memory [`AttributeStore`]
#[derive(Default)]
pub struct MemoryAttributeStore {
    attributes: RwLock<HashMap<AttributeSlot, AttributeKv>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self) -> Vec<AttributeKv> {
        self.attributes.read().values().cloned().collect()
    }

    pub fn restore(&self, attributes: Vec<AttributeKv>) {
        let mut map = self.attributes.write();
        map.clear();
        for a in attributes {
            map.insert((a.entity_id, a.scope, a.key.clone()), a);
        }
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn save(
        &self,
        entity_id: EntityId,
        scope: AttributeScope,
        key: &str,
        value: KvValue,
        last_update_ts: Timestamp,
    ) -> Result<()> {
        let attribute = AttributeKv {
            entity_id,
            scope,
            key: key.to_string(),
            value,
            last_update_ts,
        };
        self.attributes
            .write()
            .insert((entity_id, scope, key.to_string()), attribute);
        Ok(())
    }

    fn get(&self, entity_id: EntityId, scope: AttributeScope, key: &str) -> Result<Option<AttributeKv>> {
        Ok(self
            .attributes
            .read()
            .get(&(entity_id, scope, key.to_string()))
            .cloned())
    }
}
