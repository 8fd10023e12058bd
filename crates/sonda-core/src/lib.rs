//! # sonda-core
//!
//! A schema-aware streaming query engine over Protocol Buffer wire format.
//!
//! Given a catalog of compiled descriptor sets, a path-expression query
//! naming a root message type and a traversal into its fields, and a
//! serialized payload, the engine extracts scalar or JSON result rows in a
//! single pass over the wire stream, without materializing the decoded
//! message tree.
//!
//! ## Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`catalog`]: Named descriptor sets and JSON rendering
//! - [`query`]: Query compilation and the execution façade
//! - [`scan`]: Wire-format reading and the streaming traverser
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use sonda_core::{Catalog, Query};
//! use std::fs;
//!
//! // Register a compiled FileDescriptorSet under the default set name
//! let mut catalog = Catalog::new();
//! catalog.add_set_bytes("default", &fs::read("./schema.binpb")?)?;
//!
//! // Compile once, run over any number of payloads
//! let mut query = Query::new(&catalog, "ex.M:sub.x", None)?;
//! for row in query.run(&fs::read("./payload.bin")?)? {
//!     println!("{}", row);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Query syntax
//!
//! `[set:]package.Message:path`, where `path` is a dot-separated list of
//! field names or numbers. Repeated fields take an index selector (`[3]`,
//! `[*]`); maps take a key (`[some_key]`), `[*]` for all values, or
//! `|keys` for all keys. An empty path renders the whole message as JSON.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod catalog;
pub mod error;
pub mod query;
pub mod scan;

// Re-export primary types for convenience
pub use catalog::{Catalog, DescSet, JsonRenderer};
pub use error::{Error, Result};
pub use query::Query;

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
