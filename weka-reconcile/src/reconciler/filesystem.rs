//! Filesystem reconciler.
//!
//! Capacities are declared in decimal gigabytes and stored remotely in bytes.
//! A tiered filesystem is backed by exactly one OBS bucket; the API allows
//! more, but such filesystems are reported as unsupported rather than
//! silently truncated.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{EntityReconciler, absent_as_not_found};
use crate::apply::SubCall;
use crate::error::{ReconcileError, Result};
use crate::policy::{ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::{Envelope, Transport, decode};

/// One gigabyte as the API counts it.
pub const GB: i64 = 1_000_000_000;

pub fn gb_to_bytes(field: &str, gb: i64) -> Result<i64> {
    if gb < 0 {
        return Err(ReconcileError::invalid(field, "must not be negative"));
    }
    gb.checked_mul(GB)
        .ok_or_else(|| ReconcileError::invalid(field, format!("{gb} GB does not fit in bytes")))
}

/// Whole gigabytes, rounding down.
pub fn bytes_to_gb(bytes: i64) -> i64 {
    bytes / GB
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilesystemRecord {
    uid: String,
    name: String,
    group_name: String,
    group_id: String,
    status: String,
    is_encrypted: bool,
    auth_required: bool,
    used_total: i64,
    available_total: i64,
    used_ssd: i64,
    available_ssd: i64,
    obs_buckets: Vec<ObsBucket>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ObsBucket {
    name: String,
}

impl FilesystemRecord {
    fn computed(&self) -> DeclaredState {
        let mut state = DeclaredState::new();
        for (field, value) in [("group_id", &self.group_id), ("status", &self.status)] {
            if !value.is_empty() {
                state.set(field, value.as_str());
            }
        }
        state
    }

    /// The SSD capacity is optional; it is reported only when `known`
    /// declares it, so an undeclared capacity never shows up as drift.
    fn reported(&self, known: &DeclaredState) -> Result<DeclaredState> {
        if self.obs_buckets.len() > 1 {
            return Err(ReconcileError::UnsupportedConfiguration(format!(
                "filesystem {} has {} OBS buckets; tiered filesystems with more than one OBS bucket are not supported",
                self.name,
                self.obs_buckets.len()
            )));
        }

        let mut state = self
            .computed()
            .with("name", self.name.as_str())
            .with("group_name", self.group_name.as_str())
            .with(
                "total_capacity_gb",
                bytes_to_gb(self.used_total.saturating_add(self.available_total)),
            )
            .with("encrypted", self.is_encrypted)
            .with("auth_required", self.auth_required);

        match self.obs_buckets.first() {
            Some(obs) => {
                state.set("tiered", true);
                state.set("obs_name", obs.name.as_str());
                if known.contains("ssd_capacity_gb") {
                    state.set(
                        "ssd_capacity_gb",
                        bytes_to_gb(self.used_ssd.saturating_add(self.available_ssd)),
                    );
                }
            }
            None => state.set("tiered", false),
        }

        Ok(state)
    }
}

/// Fields of a filesystem update and their wire names, in body order.
const UPDATABLE: &[(&str, &str)] = &[
    ("name", "new_name"),
    ("total_capacity_gb", "total_capacity"),
    ("ssd_capacity_gb", "ssd_capacity"),
    ("auth_required", "auth_required"),
];

pub struct FilesystemReconciler {
    transport: Arc<dyn Transport>,
}

impl FilesystemReconciler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn wire_value(desired: &DeclaredState, field: &str) -> Result<Value> {
        Ok(match field {
            "total_capacity_gb" | "ssd_capacity_gb" => {
                json!(gb_to_bytes(field, desired.require_int(field)?)?)
            }
            _ => desired.get(field).cloned().unwrap_or(Value::Null),
        })
    }
}

#[async_trait]
impl EntityReconciler for FilesystemReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Filesystem
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn validate(&self, desired: &DeclaredState) -> Result<()> {
        gb_to_bytes("total_capacity_gb", desired.require_int("total_capacity_gb")?)?;

        if desired.flag("tiered")? {
            desired.require_str("obs_name")?;
            if let Some(ssd) = desired.int("ssd_capacity_gb")? {
                gb_to_bytes("ssd_capacity_gb", ssd)?;
            }
        } else {
            for field in ["obs_name", "ssd_capacity_gb"] {
                if desired.contains(field) {
                    return Err(ReconcileError::invalid(
                        field,
                        "only applies to tiered filesystems",
                    ));
                }
            }
        }
        Ok(())
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let name = desired.require_str("name")?;
        let tiered = desired.flag("tiered")?;
        info!(name = %name, tiered, "Creating filesystem");

        let mut body = Map::new();
        body.insert("name".into(), json!(name));
        body.insert("group_name".into(), json!(desired.require_str("group_name")?));
        body.insert(
            "total_capacity".into(),
            Self::wire_value(desired, "total_capacity_gb")?,
        );
        for flag in ["encrypted", "auth_required", "allow_no_kms"] {
            body.insert(flag.into(), json!(desired.flag(flag)?));
        }
        if tiered {
            body.insert("obs_name".into(), json!(desired.require_str("obs_name")?));
            if desired.contains("ssd_capacity_gb") {
                body.insert(
                    "ssd_capacity".into(),
                    Self::wire_value(desired, "ssd_capacity_gb")?,
                );
            }
        }

        let payload = self
            .transport
            .send(Method::POST, "fileSystems", Some(&Value::Object(body)))
            .await?;
        let created: Envelope<FilesystemRecord> = decode(&payload, "created filesystem")?;

        if created.data.uid.is_empty() {
            return Err(ReconcileError::unexpected(
                "created filesystem",
                "response carries no uid",
            ));
        }

        let mut state = desired.clone();
        state.merge(&created.data.computed());
        Ok(Resource::new(created.data.uid, state))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self
            .transport
            .send(Method::GET, &format!("fileSystems/{id}"), None)
            .await
            .map_err(|e| absent_as_not_found(self.kind(), id, e))?;
        let record: Envelope<FilesystemRecord> = decode(&payload, "filesystem")?;

        let mut state = known.clone();
        state.merge(&record.data.reported(known)?);
        Ok(state)
    }

    fn plan_update(
        &self,
        id: &str,
        _previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>> {
        let tiered = desired.flag("tiered")?;
        if tiered && changes.contains("ssd_capacity_gb") && !desired.contains("ssd_capacity_gb") {
            return Err(ReconcileError::invalid(
                "ssd_capacity_gb",
                "cannot be removed from a tiered filesystem; declare the capacity to keep",
            ));
        }
        let mut body = Map::new();
        let mut fields = Vec::new();

        for (field, wire) in UPDATABLE {
            if !changes.contains(field) || (*field == "ssd_capacity_gb" && !tiered) {
                continue;
            }
            body.insert(wire.to_string(), Self::wire_value(desired, field)?);
            fields.push(*field);
        }

        if fields.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![SubCall::put(
            "filesystem",
            format!("fileSystems/{id}"),
            Value::Object(body),
            fields,
        )])
    }

    fn absorb_update_response(
        &self,
        _call: &SubCall,
        payload: &[u8],
        actual: &mut DeclaredState,
    ) -> Result<()> {
        let record: Envelope<Option<FilesystemRecord>> = decode(payload, "updated filesystem")?;
        match record.data {
            Some(record) if !record.uid.is_empty() => {
                let reported = record.reported(actual)?;
                actual.merge(&reported);
            }
            _ => debug!("Filesystem update response carried no record"),
        }
        Ok(())
    }

    async fn delete(&self, id: &str, _known: &DeclaredState) -> Result<()> {
        info!(id = %id, "Deleting filesystem");
        self.transport
            .send(Method::DELETE, &format!("fileSystems/{id}"), None)
            .await?;
        Ok(())
    }
}
