//! User to S3 policy binding reconciler.
//!
//! A user has at most one attached policy, so the binding is identified by
//! the username. Attaching replaces whatever policy the user had.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::EntityReconciler;
use crate::apply::SubCall;
use crate::error::{ReconcileError, Result};
use crate::policy::{ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::{Envelope, Transport, decode};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserPolicies {
    users: HashMap<String, Option<String>>,
}

pub struct UserPolicyReconciler {
    transport: Arc<dyn Transport>,
}

impl UserPolicyReconciler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn attach_call(desired: &DeclaredState) -> Result<SubCall> {
        Ok(SubCall::post(
            "attach",
            "s3/policies/attach",
            json!({
                "user_name": desired.require_str("username")?,
                "policy_name": desired.require_str("s3_policy_name")?,
            }),
            vec!["s3_policy_name"],
        ))
    }
}

#[async_trait]
impl EntityReconciler for UserPolicyReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::UserPolicyBinding
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let username = desired.require_str("username")?;
        let policy = desired.require_str("s3_policy_name")?;
        info!(username = %username, policy = %policy, "Attaching S3 policy");

        let attach = Self::attach_call(desired)?;

        self.transport
            .send(attach.method, &attach.path, attach.body.as_ref())
            .await?;

        Ok(Resource::new(username, desired.clone()))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self
            .transport
            .send(Method::GET, "s3/userPolicies", None)
            .await?;
        let listed: Envelope<UserPolicies> = decode(&payload, "user policies")?;

        // No entry and an empty policy both mean nothing is attached.
        let policy = listed
            .data
            .users
            .get(id)
            .and_then(|p| p.as_deref())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ReconcileError::NotFound {
                kind: self.kind(),
                id: id.to_string(),
            })?;

        let mut state = known.clone();
        state.set("s3_policy_name", policy);
        Ok(state)
    }

    fn plan_update(
        &self,
        _id: &str,
        _previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>> {
        if !changes.contains("s3_policy_name") {
            return Ok(Vec::new());
        }
        Ok(vec![Self::attach_call(desired)?])
    }

    async fn delete(&self, id: &str, _known: &DeclaredState) -> Result<()> {
        info!(username = %id, "Detaching S3 policy");
        self.transport
            .send(
                Method::POST,
                "s3/policies/detach",
                Some(&json!({"user_name": id})),
            )
            .await?;
        Ok(())
    }
}
