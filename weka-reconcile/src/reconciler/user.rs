//! User reconciler.
//!
//! The API has no single-user GET, so Read lists every user and scans for the
//! stored uid. Only `username`, `role`, `org_id` and `source` come back; the
//! password and posix ids keep their declared values.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{EntityReconciler, scan};
use crate::apply::SubCall;
use crate::error::Result;
use crate::policy::{ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::{Envelope, Transport, decode};

const ATTRIBUTES: &[&str] = &["role", "posix_uid", "posix_gid"];

#[derive(Debug, Deserialize)]
struct UserRecord {
    uid: String,
    username: String,
    role: String,
    #[serde(default)]
    org_id: Option<i64>,
    #[serde(default)]
    source: Option<String>,
}

impl UserRecord {
    fn reported(&self) -> DeclaredState {
        let mut state = DeclaredState::new()
            .with("username", self.username.as_str())
            .with("role", self.role.as_str());
        state.set("org_id", self.org_id);
        state.set("source", self.source.clone());
        state
    }
}

pub struct UserReconciler {
    transport: Arc<dyn Transport>,
    org: String,
}

impl UserReconciler {
    pub fn new(transport: Arc<dyn Transport>, org: impl Into<String>) -> Self {
        Self {
            transport,
            org: org.into(),
        }
    }
}

#[async_trait]
impl EntityReconciler for UserReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::User
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let username = desired.require_str("username")?;
        info!(username = %username, "Creating user");

        let mut body = Map::new();
        body.insert("username".into(), json!(username));
        body.insert("password".into(), json!(desired.require_str("password")?));
        body.insert("role".into(), json!(desired.require_str("role")?));
        for field in ["posix_uid", "posix_gid"] {
            if let Some(id) = desired.int(field)? {
                body.insert(field.into(), json!(id));
            }
        }

        let payload = self
            .transport
            .send(Method::POST, "users", Some(&Value::Object(body)))
            .await?;
        let created: Envelope<UserRecord> = decode(&payload, "created user")?;

        let mut state = desired.clone();
        state.set("org_id", created.data.org_id);
        state.set("source", created.data.source);

        Ok(Resource::new(created.data.uid, state))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self.transport.send(Method::GET, "users", None).await?;
        let listed: Envelope<Vec<UserRecord>> = decode(&payload, "user list")?;

        let record = scan(self.kind(), id, &listed.data, |u| u.uid.as_str())?;

        let mut state = known.clone();
        state.merge(&record.reported());
        Ok(state)
    }

    fn plan_update(
        &self,
        id: &str,
        previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>> {
        let mut calls = Vec::new();

        if changes.contains("password") {
            calls.push(SubCall::put(
                "password",
                "users/password",
                json!({
                    "username": desired.require_str("username")?,
                    "old_password": previous.str("password")?.unwrap_or_default(),
                    "new_password": desired.require_str("password")?,
                    "org": self.org,
                }),
                vec!["password"],
            ));
        }

        let changed = changes.among(ATTRIBUTES);
        if !changed.is_empty() {
            let body: Map<String, Value> = changed
                .iter()
                .map(|f| (f.to_string(), desired.get(f).cloned().unwrap_or(Value::Null)))
                .collect();
            calls.push(SubCall::put(
                "attributes",
                format!("users/{id}"),
                Value::Object(body),
                changed,
            ));
        }

        Ok(calls)
    }

    async fn delete(&self, id: &str, _known: &DeclaredState) -> Result<()> {
        info!(id = %id, "Deleting user");
        self.transport
            .send(Method::DELETE, &format!("users/{id}"), None)
            .await?;
        Ok(())
    }
}
