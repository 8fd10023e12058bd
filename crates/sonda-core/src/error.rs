//! Error types for the sonda-core library.
//!
//! This module provides error handling using the `thiserror` crate, with one
//! variant per failure class a query can hit: malformed payloads, invalid
//! queries, exhausted recursion budgets, and descriptor-set loading problems.

use thiserror::Error;

/// Result type alias for sonda operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for catalog loading, query compilation and query execution
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed protobuf wire data in the payload
    #[error("malformed protobuf payload: {detail}")]
    BadProto {
        /// Wire-level description of the problem
        detail: String,
    },

    /// Syntactically or semantically invalid query text
    #[error("invalid query: {detail}")]
    BadQuery {
        /// What was wrong with the query
        detail: String,
    },

    /// Submessage nesting exceeded the wire reader's recursion budget
    #[error("submessage nesting exceeds the recursion limit of {limit}")]
    RecursionDepthExceeded {
        /// The configured recursion limit
        limit: u32,
    },

    /// Failed to decode a serialized `FileDescriptorSet`
    #[error("failed to decode file descriptor set: {0}")]
    DescriptorDecode(#[from] prost::DecodeError),

    /// A decoded descriptor set could not be added to the pool
    #[error("failed to build descriptor pool: {0}")]
    DescriptorBuild(#[from] prost_reflect::DescriptorError),
}

impl Error {
    /// Creates a new malformed-payload error
    pub fn bad_proto(detail: impl Into<String>) -> Self {
        Self::BadProto {
            detail: detail.into(),
        }
    }

    /// Creates a new invalid-query error
    pub fn bad_query(detail: impl Into<String>) -> Self {
        Self::BadQuery {
            detail: detail.into(),
        }
    }

    /// Returns true if the error blames the payload rather than the query
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            Self::BadProto { .. } | Self::RecursionDepthExceeded { .. }
        )
    }
}
