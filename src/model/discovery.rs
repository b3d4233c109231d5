//! Facts discovered at runtime: endpoints, secrets and files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One reachable address for an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u32,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u32) -> Self {
        Self { address: address.into(), port }
    }
}

/// Upstream name to its ordered endpoints.
pub type EndpointGroups = BTreeMap<String, Vec<Endpoint>>;

/// A decoded secret: string keys to string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// Secret ref to decoded secret.
pub type SecretMap = BTreeMap<String, Secret>;

/// Raw contents of a tracked file or artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub contents: Vec<u8>,
}

impl FileContents {
    pub fn as_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.contents).ok()
    }
}

/// File ref to its contents.
pub type Files = BTreeMap<String, FileContents>;
