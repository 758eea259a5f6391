//! Ordered environment variable lists.
//!
//! Commands receive their environment as a string of `export KEY="VALUE";`
//! fragments prepended to the shell snippet, so the rendering must keep a
//! stable order: later `set` calls override earlier entries in place and
//! new keys append at the end.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Errors raised while building an environment list.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A `-e` flag value without a `=` separator.
    #[error("invalid environment assignment '{0}', expected KEY=VALUE")]
    BadAssignment(String),
}

/// A single environment entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// An ordered `(key, value)` sequence with override-in-place semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvList(Vec<EnvVar>);

impl EnvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|var| var.key == key)
            .map(|var| var.value.as_str())
    }

    /// Update `key` in place if present, otherwise append it.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(var) = self.0.iter_mut().find(|var| var.key == key) {
            var.value = value.to_string();
            return;
        }
        self.0.push(EnvVar {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Apply every entry of `other` on top of this list.
    pub fn merge(&mut self, other: &EnvList) {
        for var in other.iter() {
            self.set(&var.key, &var.value);
        }
    }

    /// Apply `KEY=VALUE` assignments, e.g. from repeated `-e` flags.
    pub fn set_assignments(&mut self, assignments: &[String]) -> Result<(), EnvError> {
        for assignment in assignments {
            let (key, value) = assignment
                .split_once('=')
                .ok_or_else(|| EnvError::BadAssignment(assignment.clone()))?;
            self.set(key, value);
        }
        Ok(())
    }

    /// Render the list as shell export fragments for remote execution.
    pub fn as_export(&self) -> String {
        let mut out = String::new();
        for var in &self.0 {
            out.push_str(&format!("export {}=\"{}\";", var.key, var.value));
        }
        out
    }
}

impl<'de> Deserialize<'de> for EnvList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EnvListVisitor;

        impl<'de> Visitor<'de> for EnvListVisitor {
            type Value = EnvList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of environment variables")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut list = EnvList::new();
                while let Some((key, value)) = map.next_entry::<String, serde_yaml::Value>()? {
                    list.set(&key, &scalar_to_string(&value));
                }
                Ok(list)
            }
        }

        deserializer.deserialize_map(EnvListVisitor)
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_appends_new_keys_in_order() {
        let mut env = EnvList::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("C", "3");
        let keys: Vec<&str> = env.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_set_overrides_in_place() {
        let mut env = EnvList::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "override");
        let keys: Vec<&str> = env.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(env.get("A"), Some("override"));
    }

    #[test]
    fn test_as_export_renders_all_entries() {
        let mut env = EnvList::new();
        env.set("FOO", "bar");
        env.set("BAZ", "qux");
        assert_eq!(env.as_export(), "export FOO=\"bar\";export BAZ=\"qux\";");
    }

    #[test]
    fn test_merge_overrides_and_appends() {
        let mut base = EnvList::new();
        base.set("A", "1");
        base.set("B", "2");
        let mut top = EnvList::new();
        top.set("B", "20");
        top.set("C", "30");
        base.merge(&top);
        assert_eq!(base.get("A"), Some("1"));
        assert_eq!(base.get("B"), Some("20"));
        assert_eq!(base.get("C"), Some("30"));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_set_assignments() {
        let mut env = EnvList::new();
        env.set_assignments(&["A=1".to_string(), "B=x=y".to_string()])
            .unwrap();
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("x=y"));
    }

    #[test]
    fn test_set_assignments_rejects_missing_separator() {
        let mut env = EnvList::new();
        let err = env.set_assignments(&["NOPE".to_string()]).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn test_deserialize_keeps_document_order() {
        let env: EnvList = serde_yaml::from_str("Z: last\nA: first\nN: 42\n").unwrap();
        let keys: Vec<&str> = env.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["Z", "A", "N"]);
        assert_eq!(env.get("N"), Some("42"));
    }
}
