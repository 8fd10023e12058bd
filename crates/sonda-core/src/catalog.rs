//! Descriptor catalog: named sets of compiled protobuf schemas.
//!
//! A [`Catalog`] maps set names to [`DescSet`]s, each backed by a
//! `prost_reflect::DescriptorPool` built from serialized
//! `FileDescriptorSet` blobs. Queries resolve their root message and field
//! descriptors here, and submessage results are rendered to canonical JSON
//! through the set's [`JsonRenderer`].
//!
//! The catalog is a plain value: the host decides when to build one and
//! how long to keep it, and hands a shared reference to each query.

use std::collections::HashMap;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use prost_types::FileDescriptorSet;
use tracing::debug;

use crate::error::{Error, Result};

/// Prefix of the type-URL convention used by the JSON renderer
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// The name resolved when a query does not name a descriptor set
pub const DEFAULT_SET_NAME: &str = "default";

/// Builds the type URL for a fully qualified message name
pub fn type_url_for(full_name: &str) -> String {
    format!("{TYPE_URL_PREFIX}{full_name}")
}

/// A named collection of descriptor sets
#[derive(Debug, Default)]
pub struct Catalog {
    sets: HashMap<String, DescSet>,
}

impl Catalog {
    /// Creates an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a serialized `FileDescriptorSet` and merges it into the
    /// named set, creating the set on first use.
    ///
    /// Adding several blobs under one name accumulates their files in a
    /// single pool.
    pub fn add_set_bytes(&mut self, name: impl Into<String>, bytes: &[u8]) -> Result<()> {
        let name = name.into();
        let fds = FileDescriptorSet::decode(bytes)?;
        debug!(set = name.as_str(), files = fds.file.len(), "adding descriptor set");
        let set = self.sets.entry(name).or_default();
        set.pool.add_file_descriptor_set(fds)?;
        Ok(())
    }

    /// Looks up a descriptor set by name
    pub fn get_set(&self, name: &str) -> Option<&DescSet> {
        self.sets.get(name)
    }

    /// Number of registered sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// True when no set has been registered
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// One descriptor set: a pool of resolved schemas plus a JSON renderer
#[derive(Debug, Default)]
pub struct DescSet {
    pool: DescriptorPool,
}

impl DescSet {
    /// Resolves a message descriptor by fully qualified name
    pub fn find_message(&self, full_name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(full_name)
    }

    /// A renderer that can convert binary messages from this set to JSON
    pub fn json_renderer(&self) -> JsonRenderer {
        JsonRenderer {
            pool: self.pool.clone(),
        }
    }
}

/// Renders binary submessages to canonical protobuf JSON.
///
/// Cheap to clone: descriptor pools share their backing storage.
#[derive(Debug, Clone)]
pub struct JsonRenderer {
    pool: DescriptorPool,
}

impl JsonRenderer {
    /// Converts message bytes identified by a type URL to a JSON string
    pub fn binary_to_json(&self, type_url: &str, bytes: &[u8]) -> Result<String> {
        let full_name = type_url
            .strip_prefix(TYPE_URL_PREFIX)
            .ok_or_else(|| Error::bad_proto(format!("unsupported type URL: {type_url}")))?;
        let desc = self
            .pool
            .get_message_by_name(full_name)
            .ok_or_else(|| Error::bad_proto(format!("unknown message type: {full_name}")))?;
        let message = DynamicMessage::decode(desc, bytes)
            .map_err(|e| Error::bad_proto(format!("failed to decode submessage: {e}")))?;
        serde_json::to_string(&message)
            .map_err(|e| Error::bad_proto(format!("failed to convert submessage to JSON: {e}")))
    }
}
