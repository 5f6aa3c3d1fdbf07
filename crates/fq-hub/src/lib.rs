//! # fq-hub — Query translation engine
//!
//! Resolves and caches table schemas, normalizes queries against them,
//! picks a backend request shape and decodes the answer into a uniform
//! [`ResultContainer`](fq_core::ResultContainer). The `fq-hub` binary
//! serves the [`Engine`] over HTTP.

pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod engine;
pub mod freshness;
pub mod list;
pub mod mutation;
pub mod normalize;
pub mod strategy;
pub mod template;
pub mod translate;

pub use cache::{CacheEntry, SchemaCache};
pub use catalog::{MetadataCatalog, META_COLUMNS};
pub use config::{Config, Settings};
pub use container::Container;
pub use dispatch::Shape;
pub use engine::Engine;
pub use freshness::FreshnessReport;
pub use mutation::{UpdateCommand, UpdateSummary};
pub use translate::{LiteralTranslator, ScriptTranslator};
