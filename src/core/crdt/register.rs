// src/core/crdt/register.rs

//! The register node: a single immutable JSON value. Registers carry list
//! items and map entries; changing a register means replacing it.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct RegisterState {
    pub data: Value,
}
