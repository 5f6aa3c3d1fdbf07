//! # fq-core — The data model of FQ
//!
//! Everything the query engine passes around and nothing that talks to a
//! backend: typed [`Column`]s with their nested-document path, the
//! [`Domain`] classifier, the query algebra ([`Query`], [`Filter`]), the
//! uniform [`ResultContainer`] and the structured [`QueryError`].
//!
//! The crate is pure: no I/O, no clocks except where a caller hands one in.

pub mod column;
pub mod domain;
pub mod error;
pub mod expr;
pub mod path;
pub mod query;
pub mod result;

pub use column::{parse_properties, Column};
pub use domain::{classify, ColumnStats, Domain};
pub use error::{ErrorKind, FailedItem, QueryError};
pub use expr::Filter;
pub use query::{Edge, Format, Query, QueryMeta, Select, Sort, SortOrder, Source};
pub use result::{EdgeSummary, ResultContainer, ResultMeta, Row};
