//! Configuration values.
//!
//! A declaration block parses into a [`ConfigMap`] of [`ConfigValue`]s. The
//! value type is a closed tree: environment and component references are
//! explicit variants, so resolution is a tree walk rather than dynamic type
//! inspection. Walks, copies and drops keep their pending nodes on the heap.

use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A numeric literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// A literal without a fractional part.
    Integer(i64),
    /// A literal with a fractional part.
    Float(f64),
}

impl Number {
    /// Returns the value as a float.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub const fn as_f64(self) -> f64 {
        match self {
            Self::Integer(n) => n as f64,
            Self::Float(f) => f,
        }
    }

    /// Returns the value if it is an integer.
    #[must_use]
    pub const fn as_i64(self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(n),
            Self::Float(_) => None,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

/// A value in a declaration block.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A quoted string literal, or a resolved environment variable.
    String(String),
    /// A boolean literal (`true`/`false` in any casing).
    Bool(bool),
    /// A bare numeric literal.
    Number(Number),
    /// An unresolved `$NAME` environment reference.
    EnvRef(String),
    /// A bare identifier naming another declaration.
    ComponentRef(String),
    /// A nested `{ ... }` block.
    Mapping(ConfigMap),
    /// A `[ ... ]` list.
    List(Vec<ConfigValue>),
    /// Explicit "no value": an environment variable that was not set.
    Absent,
}

impl ConfigValue {
    /// Returns the string if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean if this is a boolean value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer if this is an integer literal.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Returns the number as a float if this is any numeric literal.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(n.as_f64()),
            _ => None,
        }
    }

    /// Returns the nested block if this is a mapping.
    #[must_use]
    pub const fn as_mapping(&self) -> Option<&ConfigMap> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the items if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the referenced declaration name if this is a component reference.
    #[must_use]
    pub fn as_component_ref(&self) -> Option<&str> {
        match self {
            Self::ComponentRef(name) => Some(name),
            _ => None,
        }
    }

    /// Returns `true` for the explicit "no value" marker.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Collects every component reference in this value, depth first, in
    /// source order.
    pub fn component_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        collect_refs(vec![self], out);
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::EnvRef(_) => "environment reference",
            Self::ComponentRef(_) => "component reference",
            Self::Mapping(_) => "mapping",
            Self::List(_) => "list",
            Self::Absent => "absent value",
        }
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(Number::Integer(n)) => serializer.serialize_i64(*n),
            Self::Number(Number::Float(x)) => serializer.serialize_f64(*x),
            Self::EnvRef(name) => serializer.serialize_str(&format!("${name}")),
            Self::ComponentRef(name) => serializer.serialize_str(name),
            Self::Mapping(map) => map.serialize(serializer),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Absent => serializer.serialize_none(),
        }
    }
}

/// An insertion-ordered map with unique keys.
///
/// Consumers iterate keys in declaration order, so the map never reorders.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigMap {
    entries: Vec<(String, ConfigValue)>,
}

impl ConfigMap {
    /// Creates an empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts a value, returning the previous value for `key` if any.
    ///
    /// A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: ConfigValue) -> Option<ConfigValue> {
        let key = key.into();
        if let Some(slot) = self.get_mut(&key) {
            return Some(std::mem::replace(slot, value));
        }
        self.entries.push((key, value));
        None
    }

    /// Returns the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns a mutable reference to the value for `key`.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut ConfigValue> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Mutable values in declaration order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut ConfigValue> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collects every component reference under this map, in source order.
    pub fn component_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        collect_refs(self.entries.iter().rev().map(|(_, v)| v).collect(), out);
    }
}

/// Depth-first reference walk; `pending` is popped from the back, so it
/// holds siblings in reverse source order.
fn collect_refs<'a>(mut pending: Vec<&'a ConfigValue>, out: &mut Vec<&'a str>) {
    while let Some(value) = pending.pop() {
        match value {
            ConfigValue::ComponentRef(name) => out.push(name),
            ConfigValue::Mapping(map) => pending.extend(map.entries.iter().rev().map(|(_, v)| v)),
            ConfigValue::List(items) => pending.extend(items.iter().rev()),
            ConfigValue::String(_)
            | ConfigValue::Bool(_)
            | ConfigValue::Number(_)
            | ConfigValue::EnvRef(_)
            | ConfigValue::Absent => {}
        }
    }
}

/// A container being copied: the source children left to visit and the
/// copies made so far.
enum Copying<'a> {
    Map {
        source: std::slice::Iter<'a, (String, ConfigValue)>,
        key: Option<&'a str>,
        built: Vec<(String, ConfigValue)>,
    },
    List {
        source: std::slice::Iter<'a, ConfigValue>,
        built: Vec<ConfigValue>,
    },
}

impl<'a> Copying<'a> {
    fn map(map: &'a ConfigMap) -> Self {
        Self::Map {
            source: map.entries.iter(),
            key: None,
            built: Vec::with_capacity(map.entries.len()),
        }
    }

    fn list(items: &'a [ConfigValue]) -> Self {
        Self::List {
            source: items.iter(),
            built: Vec::with_capacity(items.len()),
        }
    }

    fn next_child(&mut self) -> Option<&'a ConfigValue> {
        match self {
            Self::Map { source, key, .. } => source.next().map(|(k, v)| {
                *key = Some(k.as_str());
                v
            }),
            Self::List { source, .. } => source.next(),
        }
    }

    fn attach(&mut self, value: ConfigValue) {
        match self {
            Self::Map { key, built, .. } => {
                if let Some(key) = key.take() {
                    built.push((key.to_string(), value));
                }
            }
            Self::List { built, .. } => built.push(value),
        }
    }

    fn finish(self) -> ConfigValue {
        match self {
            Self::Map { built, .. } => ConfigValue::Mapping(ConfigMap { entries: built }),
            Self::List { built, .. } => ConfigValue::List(built),
        }
    }
}

impl Clone for ConfigMap {
    fn clone(&self) -> Self {
        let mut stack = vec![Copying::map(self)];
        while let Some(top) = stack.last_mut() {
            match top.next_child() {
                Some(ConfigValue::Mapping(map)) => stack.push(Copying::map(map)),
                Some(ConfigValue::List(items)) => stack.push(Copying::list(items)),
                Some(leaf) => top.attach(leaf.clone()),
                None => {
                    let Some(done) = stack.pop() else { break };
                    let value = done.finish();
                    let Some(parent) = stack.last_mut() else {
                        if let ConfigValue::Mapping(map) = value {
                            return map;
                        }
                        break;
                    };
                    parent.attach(value);
                }
            }
        }
        Self::new()
    }
}

impl Drop for ConfigMap {
    fn drop(&mut self) {
        if !self.entries.iter().any(|(_, v)| matches!(v, ConfigValue::Mapping(_) | ConfigValue::List(_))) {
            return;
        }
        let mut pending: Vec<ConfigValue> = self.entries.drain(..).map(|(_, v)| v).collect();
        while let Some(mut value) = pending.pop() {
            match &mut value {
                ConfigValue::Mapping(map) => pending.extend(map.entries.drain(..).map(|(_, v)| v)),
                ConfigValue::List(items) => pending.append(items),
                _ => {}
            }
        }
    }
}

impl Serialize for ConfigMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>> FromIterator<(K, ConfigValue)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (K, ConfigValue)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            let _ = map.insert(key, value);
        }
        map
    }
}
