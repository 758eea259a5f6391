//! Supfile loading and decoding.
//!
//! The Supfile is a YAML document with `version`, `env`, `networks`,
//! `commands` and `targets` at the top level. Name → item maps keep their
//! document order so usage listings read the way the file is written.

use crate::command::Command;
use crate::env::EnvList;
use crate::network::Network;
use serde::de::{DeserializeOwned, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a Supfile.
#[derive(Debug, Error)]
pub enum SupfileError {
    #[error("failed to read Supfile at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode Supfile: {0}")]
    Decode(#[from] serde_yaml::Error),
}

/// A name → item map that remembers insertion order.
#[derive(Debug, Clone)]
pub struct NamedMap<T> {
    names: Vec<String>,
    items: HashMap<String, T>,
}

impl<T> Default for NamedMap<T> {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            items: HashMap::new(),
        }
    }
}

impl<T> NamedMap<T> {
    pub fn get(&self, name: &str) -> Option<&T> {
        self.items.get(name)
    }

    /// Names in document order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn insert(&mut self, name: &str, item: T) {
        if !self.items.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.items.insert(name.to_string(), item);
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for NamedMap<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NamedMapVisitor<T>(std::marker::PhantomData<T>);

        impl<'de, T: DeserializeOwned> Visitor<'de> for NamedMapVisitor<T> {
            type Value = NamedMap<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of named items")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = NamedMap::default();
                while let Some((name, item)) = map.next_entry::<String, T>()? {
                    out.insert(&name, item);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(NamedMapVisitor(std::marker::PhantomData))
    }
}

/// The decoded configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Supfile {
    pub version: Option<String>,
    pub env: EnvList,
    pub networks: NamedMap<Network>,
    pub commands: NamedMap<Command>,
    pub targets: NamedMap<Vec<String>>,
}

impl Supfile {
    /// Decode a Supfile from YAML text.
    pub fn parse(data: &str) -> Result<Self, SupfileError> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Read and decode the Supfile at `path`.
    pub fn load(path: &Path) -> Result<Self, SupfileError> {
        let data = std::fs::read_to_string(path).map_err(|source| SupfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data)
    }
}
