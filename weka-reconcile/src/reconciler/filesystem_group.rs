//! Filesystem group reconciler.

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

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GroupRecord {
    uid: String,
    name: String,
    start_demote: i64,
    target_ssd_retention: i64,
}

impl GroupRecord {
    fn reported(&self) -> DeclaredState {
        DeclaredState::new()
            .with("name", self.name.as_str())
            .with("start_demote", self.start_demote)
            .with("target_ssd_retention", self.target_ssd_retention)
    }
}

pub struct FilesystemGroupReconciler {
    transport: Arc<dyn Transport>,
}

impl FilesystemGroupReconciler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EntityReconciler for FilesystemGroupReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::FilesystemGroup
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let name = desired.require_str("name")?;
        info!(name = %name, "Creating filesystem group");

        let body = json!({
            "name": name,
            "target_ssd_retention": desired.require_int("target_ssd_retention")?,
            "start_demote": desired.require_int("start_demote")?,
        });
        let payload = self
            .transport
            .send(Method::POST, "fileSystemsGroups", Some(&body))
            .await?;
        let created: Envelope<GroupRecord> = decode(&payload, "created filesystem group")?;

        if created.data.uid.is_empty() {
            return Err(ReconcileError::unexpected(
                "created filesystem group",
                "response carries no uid",
            ));
        }

        Ok(Resource::new(created.data.uid, desired.clone()))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self
            .transport
            .send(Method::GET, &format!("fileSystemsGroups/{id}"), None)
            .await
            .map_err(|e| absent_as_not_found(self.kind(), id, e))?;
        let record: Envelope<GroupRecord> = decode(&payload, "filesystem group")?;

        let mut state = known.clone();
        state.merge(&record.data.reported());
        Ok(state)
    }

    fn plan_update(
        &self,
        id: &str,
        _previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>> {
        let fields = changes.among(&["name", "target_ssd_retention", "start_demote"]);
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = Map::new();
        for field in &fields {
            let wire = if *field == "name" { "new_name" } else { *field };
            body.insert(
                wire.to_string(),
                desired.get(field).cloned().unwrap_or(Value::Null),
            );
        }

        Ok(vec![SubCall::put(
            "group",
            format!("fileSystemsGroups/{id}"),
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
        let record: Envelope<Option<GroupRecord>> = decode(payload, "updated filesystem group")?;
        match record.data {
            Some(record) if !record.uid.is_empty() => actual.merge(&record.reported()),
            _ => debug!("Filesystem group update response carried no record"),
        }
        Ok(())
    }

    async fn delete(&self, id: &str, _known: &DeclaredState) -> Result<()> {
        info!(id = %id, "Deleting filesystem group");
        self.transport
            .send(Method::DELETE, &format!("fileSystemsGroups/{id}"), None)
            .await?;
        Ok(())
    }
}
