//! Interfaces the filter consumes from the embedding proxy.
//!
//! The proxy runtime owns the filter chain, route table, cluster manager, and
//! stream buffers; this module defines the narrow contracts the filter needs
//! from it. Hosts provide the [`FilterCallbacks`] implementation per stream;
//! everything else is plain data handed into the filter entry points.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A dynamically-typed metadata value, mirroring the shape of a protobuf
/// `Value`: string, number, bool, struct, list, or null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the inner string if `self` is a [`Value::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the inner map if `self` is a [`Value::Struct`].
    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Struct(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Metadata attached to a route or cluster: a struct of values per filter
/// namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub filter_metadata: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Metadata {
    /// Look up a value under a filter namespace.
    pub fn value(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.filter_metadata.get(namespace)?.get(key)
    }

    /// Insert a value under a filter namespace, creating it if needed.
    pub fn insert(&mut self, namespace: &str, key: &str, value: Value) {
        self.filter_metadata
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// The route matched for the current stream: the upstream cluster it targets
/// and its metadata.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub cluster_name: String,
    pub metadata: Metadata,
}

/// Upstream cluster information, shared read-only across streams.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub metadata: Metadata,
}

/// An ordered multimap of HTTP headers. Names are lowercased on insertion;
/// pseudo-headers (`:status`) are stored like any other entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into().to_lowercase(), value.into()));
    }

    /// Remove all values for `name`, then add a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_lowercase();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Remove every value for `name`.
    pub fn remove(&mut self, name: &str) {
        let name = name.to_lowercase();
        self.entries.retain(|(k, _)| *k != name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_content_length(&mut self, length: usize) {
        self.set("content-length", length.to_string());
    }

    pub fn remove_content_length(&mut self) {
        self.remove("content-length");
    }

    pub fn remove_content_type(&mut self) {
        self.remove("content-type");
    }

    pub fn status(&self) -> Option<u16> {
        self.get(":status").and_then(|v| v.parse().ok())
    }

    pub fn set_status(&mut self, code: u16) {
        self.set(":status", code.to_string());
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.add(name, value);
        }
        map
    }
}

/// A contiguous body buffer owned by the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyBuffer {
    data: Vec<u8>,
}

impl BodyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Discard up to `count` bytes from the front of the buffer.
    pub fn drain(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    /// Insert `bytes` at the front of the buffer.
    pub fn prepend(&mut self, bytes: &[u8]) {
        self.data.splice(..0, bytes.iter().copied());
    }

    /// Move the entire contents of `other` onto the end of this buffer,
    /// leaving `other` empty.
    pub fn move_from(&mut self, other: &mut BodyBuffer) {
        self.data.append(&mut other.data);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy out the buffer as a string, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<&str> for BodyBuffer {
    fn from(value: &str) -> Self {
        Self {
            data: value.as_bytes().to_vec(),
        }
    }
}

impl From<String> for BodyBuffer {
    fn from(value: String) -> Self {
        Self {
            data: value.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for BodyBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Per-stream services the proxy exposes to the filter.
pub trait FilterCallbacks {
    /// The route matched for this stream, if any.
    fn route(&self) -> Option<&Route>;

    /// Information about the upstream cluster the route targets.
    fn cluster_info(&self) -> Option<Arc<ClusterInfo>>;

    /// Record dynamic metadata on the stream for later filters and access
    /// logs.
    fn set_dynamic_metadata(&mut self, namespace: &str, values: BTreeMap<String, Value>);

    /// Synthesize a local HTTP response, bypassing the upstream. Only
    /// meaningful on the request path before the upstream has responded.
    fn send_local_reply(&mut self, status: u16, body: &str);

    /// Hand a buffer back to the filter chain in the current direction. Used
    /// after the filter has withheld body bytes from iteration.
    fn inject_data(&mut self, data: BodyBuffer);
}

/// Source of randomness for template callbacks.
pub trait RandomGenerator: Send + Sync {
    fn random(&self) -> u64;
}

/// Default [`RandomGenerator`] backed by the thread-local OS-seeded RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdRandomGenerator;

impl RandomGenerator for StdRandomGenerator {
    fn random(&self) -> u64 {
        rand::random()
    }
}

/// Provides the function name selected for the current request, populated by
/// an upstream component before decoding starts. Only consulted in
/// functional mode.
pub trait MetadataAccessor {
    fn function_name(&self) -> Option<&str>;
}
