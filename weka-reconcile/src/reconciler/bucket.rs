//! Object-store bucket reconciler.
//!
//! A bucket is identified by its name. There is no single-bucket GET, and the
//! bucket list only reports the backing path, so drift detection is limited
//! to noticing that a bucket disappeared.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{EntityReconciler, scan};
use crate::apply::SubCall;
use crate::error::{ReconcileError, Result};
use crate::policy::{ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::{Envelope, Transport, decode};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BucketList {
    buckets: Vec<BucketRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BucketRecord {
    name: String,
    path: String,
}

/// S3 naming rules: 3 to 63 characters of `[a-z0-9.-]`, starting and
/// ending with a letter or digit.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if !(3..=63).contains(&name.len()) {
        return Err(ReconcileError::invalid(
            "bucket_name",
            "bucket names must be between 3 and 63 characters long",
        ));
    }

    let edge = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    let inner = |c: u8| edge(c) || c == b'.' || c == b'-';
    let bytes = name.as_bytes();

    let valid = edge(bytes[0])
        && edge(bytes[bytes.len() - 1])
        && bytes.iter().copied().all(inner);

    if !valid {
        return Err(ReconcileError::invalid(
            "bucket_name",
            "bucket names can only be a-z, 0-9, with dots or hyphens and must start and end with a letter or number",
        ));
    }
    Ok(())
}

pub struct BucketReconciler {
    transport: Arc<dyn Transport>,
}

impl BucketReconciler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EntityReconciler for BucketReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::ObjectStoreBucket
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn validate(&self, desired: &DeclaredState) -> Result<()> {
        validate_bucket_name(desired.require_str("bucket_name")?)?;

        if desired.contains("hard_quota") && desired.contains("existing_path") {
            return Err(ReconcileError::invalid(
                "hard_quota",
                "cannot be used when existing_path is set",
            ));
        }
        Ok(())
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let name = desired.require_str("bucket_name")?;
        info!(bucket = %name, "Creating bucket");

        let mut body = Map::new();
        body.insert("bucket_name".into(), json!(name));
        body.insert(
            "policy".into(),
            json!(desired.str("anonymous_policy_name")?.unwrap_or("none")),
        );
        body.insert("fs_uid".into(), json!(desired.require_str("fs_uid")?));
        for field in ["hard_quota", "existing_path"] {
            if let Some(value) = desired.str(field)? {
                body.insert(field.into(), json!(value));
            }
        }

        self.transport
            .send(Method::POST, "s3/buckets", Some(&Value::Object(body)))
            .await?;

        Ok(Resource::new(name, desired.clone()))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self.transport.send(Method::GET, "s3/buckets", None).await?;
        let listed: Envelope<BucketList> = decode(&payload, "bucket list")?;

        let record = scan(self.kind(), id, &listed.data.buckets, |b| b.name.as_str())?;

        let mut state = known.clone();
        if !record.path.is_empty() {
            state.set("path", record.path.as_str());
        }
        Ok(state)
    }

    fn plan_update(
        &self,
        id: &str,
        _previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>> {
        let mut calls = Vec::new();

        if changes.contains("hard_quota") {
            // An absent quota is sent as null, which lifts the limit.
            calls.push(SubCall::put(
                "quota",
                format!("s3/buckets/{id}/quota"),
                json!({"hard_quota": desired.str("hard_quota")?}),
                vec!["hard_quota"],
            ));
        }

        if changes.contains("anonymous_policy_name") {
            calls.push(SubCall::put(
                "policy",
                format!("s3/buckets/{id}/policy"),
                json!({"bucket_policy": desired.str("anonymous_policy_name")?.unwrap_or("none")}),
                vec!["anonymous_policy_name"],
            ));
        }

        Ok(calls)
    }

    async fn delete(&self, id: &str, _known: &DeclaredState) -> Result<()> {
        info!(bucket = %id, "Deleting bucket");
        self.transport
            .send(Method::DELETE, &format!("s3/buckets/{id}"), None)
            .await?;
        Ok(())
    }
}
