//! # Backend Capability Surface
//!
//! Everything the engine needs from a document store, as one trait. The
//! wire encoding is the implementation's business: [`http::HttpBackend`]
//! talks to a search-engine cluster over REST, [`memory::MemoryBackend`]
//! answers from documents held in process and records every call.

pub mod http;
pub mod memory;

use fq_core::{Column, ColumnStats, QueryError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

// =============================================================================
// Types
// =============================================================================

/// Raw schema of one table: the mapping `properties` tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub properties: Map<String, Value>,
    /// Field carrying the routing key, when the mapping declares one.
    pub routing_path: Option<String>,
}

/// One index as reported by the cluster metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetadata {
    pub name: String,
    pub aliases: Vec<String>,
    /// Creation time in epoch millis; the recency key.
    pub created: i64,
    /// Mapping type name → `properties` tree.
    pub mappings: Vec<(String, Map<String, Value>)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMetadata {
    pub indices: Vec<IndexMetadata>,
}

/// Outcome of one bulk action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItem {
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201)
    }
}

/// Backend protocol version. Major version `0` speaks the legacy
/// request form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
        Some(Self { major, minor })
    }

    pub fn is_legacy(&self) -> bool {
        self.major == 0
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new(1, 7)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("no such table `{0}`")]
    NoSuchTable(String),
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::Status { status, .. } => Some(*status),
            StoreError::NoSuchTable(_) => Some(404),
            _ => None,
        };
        QueryError::backend(e.to_string(), status)
    }
}

// =============================================================================
// Core Trait
// =============================================================================

/// The capability surface of a document store.
///
/// Calls block their task for the duration of the round trip; the engine
/// imposes no timeout of its own.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Stable identity (resolved base address) of the store answering for
    /// `table`. Nested views share their root table's identity.
    fn identity(&self, table: &str) -> String;

    fn version(&self) -> Version;

    async fn get_schema(&self, table: &str) -> Result<Schema, StoreError>;

    /// Distinct count and observed partitions per column, in one batch.
    /// Columns the store has no statistics for are absent from the map.
    async fn get_cardinality(
        &self,
        table: &str,
        columns: &[Column],
    ) -> Result<HashMap<String, ColumnStats>, StoreError>;

    async fn search(&self, table: &str, request: &Value) -> Result<Value, StoreError>;

    /// Submit action/source pairs; returns one item per action.
    async fn bulk(&self, table: &str, actions: &[Value]) -> Result<Vec<BulkItem>, StoreError>;

    async fn get_cluster_metadata(&self) -> Result<ClusterMetadata, StoreError>;

    async fn clear_cache(&self) -> Result<(), StoreError>;
}

/// First segment of a dotted table name: the index that stores it.
pub fn root_table(table: &str) -> &str {
    table.split('.').next().unwrap_or(table)
}
