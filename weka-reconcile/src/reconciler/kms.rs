//! KMS configuration reconciler.
//!
//! The cluster holds at most one KMS configuration, so the entity is a
//! singleton under the fixed identifier [`KMS_ID`]. Create and Update are
//! the same POST; the server replaces whatever was configured before.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use super::{EntityReconciler, absent_as_not_found};
use crate::apply::SubCall;
use crate::error::{ReconcileError, Result};
use crate::policy::{ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::{Envelope, Transport, decode};

pub const KMS_ID: &str = "kms";

const VAULT_FIELDS: &[&str] = &["base_url", "master_key_name", "token"];
const KMIP_FIELDS: &[&str] = &[
    "server_endpoint",
    "key_uid",
    "client_cert_pem",
    "client_key_pem",
    "ca_cert_pem",
];

#[derive(Debug, Default, Deserialize)]
struct KmsRecord {
    #[serde(default)]
    kms_type: String,
    #[serde(default)]
    params: KmsParams,
}

#[derive(Debug, Default, Deserialize)]
struct KmsParams {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    master_key_name: Option<String>,
}

fn mode_fields(desired: &DeclaredState) -> Result<(&'static str, &'static [&'static str])> {
    Ok(if desired.flag("use_vault")? {
        ("Vault", VAULT_FIELDS)
    } else {
        ("KMIP", KMIP_FIELDS)
    })
}

/// Request body holding exactly the selected mode's fields.
fn config_body(desired: &DeclaredState) -> Result<Value> {
    let (_, fields) = mode_fields(desired)?;
    let mut body = Map::new();
    for field in fields {
        body.insert(field.to_string(), Value::from(desired.require_str(field)?));
    }
    Ok(Value::Object(body))
}

pub struct KmsReconciler {
    transport: Arc<dyn Transport>,
}

impl KmsReconciler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EntityReconciler for KmsReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::KmsConfig
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn validate(&self, desired: &DeclaredState) -> Result<()> {
        let (mode, fields) = mode_fields(desired)?;
        for field in fields {
            if desired.str(field)?.is_none_or(str::is_empty) {
                return Err(ReconcileError::invalid(
                    *field,
                    format!("missing configuration value to configure KMS for {mode}"),
                ));
            }
        }
        Ok(())
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let (mode, _) = mode_fields(desired)?;
        info!(mode, "Configuring KMS");

        let body = config_body(desired)?;
        self.transport.send(Method::POST, "kms", Some(&body)).await?;

        Ok(Resource::new(KMS_ID, desired.clone()))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self
            .transport
            .send(Method::GET, "kms", None)
            .await
            .map_err(|e| absent_as_not_found(self.kind(), id, e))?;

        // An unconfigured cluster answers with an empty record.
        let record = match decode::<Envelope<Option<KmsRecord>>>(&payload, "kms configuration")?.data {
            Some(record) if !record.kms_type.is_empty() => record,
            _ => {
                return Err(ReconcileError::NotFound {
                    kind: self.kind(),
                    id: id.to_string(),
                });
            }
        };

        let mut state = known.clone();
        state.set("kms_type", record.kms_type);

        // KMIP secrets are never reported back; only vault params are.
        if known.flag("use_vault")? {
            let params = record.params;
            for (field, value) in [
                ("base_url", params.base_url),
                ("master_key_name", params.master_key_name),
            ] {
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    state.set(field, value);
                }
            }
        }

        Ok(state)
    }

    fn plan_update(
        &self,
        _id: &str,
        _previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>> {
        Ok(vec![SubCall::post(
            "configure",
            "kms",
            config_body(desired)?,
            changes.iter().collect(),
        )])
    }

    async fn delete(&self, _id: &str, _known: &DeclaredState) -> Result<()> {
        info!("Removing KMS configuration");
        self.transport.send(Method::DELETE, "kms", None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ScriptedTransport;
    use serde_json::json;

    fn vault() -> DeclaredState {
        DeclaredState::new()
            .with("use_vault", true)
            .with("base_url", "https://vault:8200")
            .with("master_key_name", "weka-key")
            .with("token", "s.secret")
    }

    #[test]
    fn test_validate_requires_selected_mode_fields() {
        let reconciler = KmsReconciler::new(Arc::new(ScriptedTransport::new()));
        reconciler.validate(&vault()).unwrap();

        let err = reconciler
            .validate(&vault().with("token", ""))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidValue { ref field, .. } if field == "token"));

        let kmip = DeclaredState::new()
            .with("use_vault", false)
            .with("server_endpoint", "kmip:5696");
        let err = reconciler.validate(&kmip).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidValue { ref field, .. } if field == "key_uid"));
    }

    #[tokio::test]
    async fn test_create_posts_only_vault_fields() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(Method::POST, "kms", json!({"data": {}}));
        let reconciler = KmsReconciler::new(transport.clone());

        let desired = vault().with("server_endpoint", "ignored:5696");
        let created = reconciler.create(&desired).await.unwrap();

        assert_eq!(created.id, KMS_ID);
        assert_eq!(
            transport.calls()[0].body,
            Some(json!({
                "base_url": "https://vault:8200",
                "master_key_name": "weka-key",
                "token": "s.secret"
            }))
        );
    }

    #[tokio::test]
    async fn test_read_reports_vault_params() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            Method::GET,
            "kms",
            json!({"data": {"kms_type": "HashiCorpVault", "params": {"base_url": "https://vault2:8200", "master_key_name": "weka-key"}}}),
        );
        let reconciler = KmsReconciler::new(transport.clone());

        let state = reconciler.read(KMS_ID, &vault()).await.unwrap();
        assert_eq!(state.get("base_url"), Some(&json!("https://vault2:8200")));
        assert_eq!(state.get("kms_type"), Some(&json!("HashiCorpVault")));
        assert_eq!(state.get("token"), Some(&json!("s.secret")));
    }

    #[tokio::test]
    async fn test_read_empty_type_is_not_found() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(Method::GET, "kms", json!({"data": {"kms_type": "", "params": {}}}));
        let reconciler = KmsReconciler::new(transport.clone());

        let err = reconciler.read(KMS_ID, &vault()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { .. }));

        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(Method::GET, "kms", json!({"data": null}));
        let reconciler = KmsReconciler::new(transport.clone());
        assert!(reconciler.read(KMS_ID, &vault()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_reposts_configuration() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(Method::POST, "kms", json!({"data": {}}));
        let reconciler = KmsReconciler::new(transport.clone());

        let previous = vault();
        let desired = vault().with("master_key_name", "rotated");
        let changes = ChangeSet::between(EntityKind::KmsConfig, &previous, &desired);

        let actual = reconciler
            .update(KMS_ID, &previous, &desired, &changes)
            .await
            .unwrap();

        assert_eq!(actual.get("master_key_name"), Some(&json!("rotated")));
        assert_eq!(transport.call_log(), vec!["POST kms"]);
    }
}
