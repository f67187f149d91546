//! Declared state of one entity instance.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReconcileError, Result};
use crate::policy::EntityKind;

/// Field name to value mapping, as declared by the host or read back from the API.
///
/// `null` and an absent key are the same thing: setting a field to `null`
/// removes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct DeclaredState(BTreeMap<String, Value>);

impl From<BTreeMap<String, Value>> for DeclaredState {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        fields.into_iter().collect()
    }
}

impl DeclaredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        match value.into() {
            Value::Null => {
                self.0.remove(field);
            }
            value => {
                self.0.insert(field.to_string(), value);
            }
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Optional string field; a non-string value is a validation error.
    pub fn str(&self, field: &str) -> Result<Option<&str>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(ReconcileError::invalid(
                field,
                format!("expected a string, got {other}"),
            )),
        }
    }

    /// String field that must be present and non-empty.
    pub fn require_str(&self, field: &str) -> Result<&str> {
        match self.str(field)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(ReconcileError::invalid(field, "a value is required")),
        }
    }

    pub fn int(&self, field: &str) -> Result<Option<i64>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| {
                ReconcileError::invalid(field, format!("expected an integer, got {v}"))
            }),
        }
    }

    pub fn require_int(&self, field: &str) -> Result<i64> {
        self.int(field)?
            .ok_or_else(|| ReconcileError::invalid(field, "a value is required"))
    }

    /// Boolean field; absent reads as `false`.
    pub fn flag(&self, field: &str) -> Result<bool> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(ReconcileError::invalid(
                field,
                format!("expected a boolean, got {other}"),
            )),
        }
    }

    /// Overlay every field of `reported` on top of `self`.
    ///
    /// Fields `reported` does not mention keep their current value, which is
    /// how values the API never returns survive a Read.
    pub fn merge(&mut self, reported: &DeclaredState) {
        for (field, value) in &reported.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Copy `field` from `source`, removing it here when `source` lacks it.
    pub fn copy_field(&mut self, source: &DeclaredState, field: &str) {
        match source.get(field) {
            Some(value) => {
                self.0.insert(field.to_string(), value.clone());
            }
            None => {
                self.0.remove(field);
            }
        }
    }

    /// Copy with every sensitive field of `kind` masked, for log output.
    pub fn redacted(&self, kind: EntityKind) -> DeclaredState {
        let mut out = self.clone();
        for field in kind.fields().iter().filter(|f| f.sensitive) {
            if out.contains(field.name) {
                out.set(field.name, "<redacted>");
            }
        }
        out
    }
}

impl FromIterator<(String, Value)> for DeclaredState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut state = Self::new();
        for (field, value) in iter {
            state.set(&field, value);
        }
        state
    }
}

impl fmt::Display for DeclaredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// An entity instance known to exist remotely: its identifier and state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub state: DeclaredState,
}

impl Resource {
    pub fn new(id: impl Into<String>, state: DeclaredState) -> Self {
        Self {
            id: id.into(),
            state,
        }
    }
}
