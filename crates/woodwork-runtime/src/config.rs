//! Typed access to a component's resolved configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use woodwork_common::error::{Result, WoodworkError};
use woodwork_compose::value::{ConfigMap, ConfigValue};

use crate::component::Component;

/// Resolved configuration of one declaration plus the live components its
/// references point at.
#[derive(Clone, Default)]
pub struct ComponentConfig {
    component: String,
    values: ConfigMap,
    refs: HashMap<String, Arc<dyn Component>>,
}

impl fmt::Debug for ComponentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut refs: Vec<&str> = self.refs.keys().map(String::as_str).collect();
        refs.sort_unstable();
        f.debug_struct("ComponentConfig")
            .field("component", &self.component)
            .field("values", &self.values)
            .field("refs", &refs)
            .finish()
    }
}

impl ComponentConfig {
    /// Wraps the configuration of the declaration named `component`.
    #[must_use]
    pub fn new(component: impl Into<String>, values: ConfigMap) -> Self {
        Self {
            component: component.into(),
            values,
            refs: HashMap::new(),
        }
    }

    /// Makes the instance declared as `name` reachable through
    /// [`ComponentConfig::component`].
    #[must_use]
    pub fn with_ref(mut self, name: impl Into<String>, instance: Arc<dyn Component>) -> Self {
        let _ = self.refs.insert(name.into(), instance);
        self
    }

    /// Name of the declaration this configuration belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.component
    }

    /// The raw value tree.
    #[must_use]
    pub const fn values(&self) -> &ConfigMap {
        &self.values
    }

    /// Returns the value under `key`, treating `Absent` as missing.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key).filter(|v| !v.is_absent())
    }

    /// Returns the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`WoodworkError::MissingConfigKey`] if the key is missing or
    /// its environment variable was unset.
    pub fn require(&self, key: &str) -> Result<&ConfigValue> {
        self.get(key).ok_or_else(|| WoodworkError::MissingConfigKey {
            component: self.component.clone(),
            key: key.to_string(),
        })
    }

    /// Returns the string under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or not a string.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        let value = self.require(key)?;
        value.as_str().ok_or_else(|| self.invalid(key, "a string"))
    }

    /// Returns the string under `key`, or `default` when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds something other than a string.
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        self.get(key)
            .map_or(Ok(default), |v| v.as_str().ok_or_else(|| self.invalid(key, "a string")))
    }

    /// Returns the boolean under `key`, or `default` when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds something other than a boolean.
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        self.get(key)
            .map_or(Ok(default), |v| v.as_bool().ok_or_else(|| self.invalid(key, "a boolean")))
    }

    /// Returns the non-negative integer under `key`, or `default` when
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds anything but a non-negative integer.
    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        self.get(key).map_or(Ok(default), |v| {
            v.as_i64()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| self.invalid(key, "a non-negative integer"))
        })
    }

    /// Returns the number under `key`, or `default` when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds something other than a number.
    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        self.get(key)
            .map_or(Ok(default), |v| v.as_f64().ok_or_else(|| self.invalid(key, "a number")))
    }

    /// Returns the strings of the list under `key`; a single string counts
    /// as a one-element list.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds anything else.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>> {
        let Some(value) = self.get(key) else {
            return Ok(Vec::new());
        };
        if let Some(single) = value.as_str() {
            return Ok(vec![single.to_string()]);
        }
        let items = value.as_list().ok_or_else(|| self.invalid(key, "a list of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid(key, "a list of strings"))
            })
            .collect()
    }

    /// Returns the live component referenced under `key`, if the key is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds something other than a reference.
    pub fn component(&self, key: &str) -> Result<Option<Arc<dyn Component>>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let name = value
            .as_component_ref()
            .ok_or_else(|| self.invalid(key, "a component reference"))?;
        self.lookup(name).map(Some)
    }

    /// Returns every live component referenced under `key`, which may hold a
    /// single reference or a list of them.
    ///
    /// # Errors
    ///
    /// Returns an error if an item is not a reference.
    pub fn components(&self, key: &str) -> Result<Vec<Arc<dyn Component>>> {
        let Some(value) = self.get(key) else {
            return Ok(Vec::new());
        };
        if let Some(name) = value.as_component_ref() {
            return Ok(vec![self.lookup(name)?]);
        }
        let items = value
            .as_list()
            .ok_or_else(|| self.invalid(key, "a list of component references"))?;
        items
            .iter()
            .map(|item| {
                let name = item
                    .as_component_ref()
                    .ok_or_else(|| self.invalid(key, "a list of component references"))?;
                self.lookup(name)
            })
            .collect()
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Component>> {
        self.refs.get(name).cloned().ok_or_else(|| WoodworkError::NotFound {
            kind: "component instance",
            id: name.to_string(),
        })
    }

    fn invalid(&self, key: &str, expected: &'static str) -> WoodworkError {
        WoodworkError::InvalidConfigValue {
            component: self.component.clone(),
            key: key.to_string(),
            expected,
        }
    }
}
