//! S3 access policy reconciler.
//!
//! Policies are identified by name. The document is opaque JSON, but it is
//! compared the way IAM compares policies so that reformatting a declaration
//! or reading back the server's rendering of it is not a change.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{EntityReconciler, absent_as_not_found};
use crate::apply::SubCall;
use crate::error::{ReconcileError, Result};
use crate::policy::{ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::{Envelope, Transport, decode};

/// Statement keys whose value may be a single string or a list of them.
const LIST_KEYS: &[&str] = &["Action", "NotAction", "Resource", "NotResource"];

/// Parse a declared document. Blank strings and `{}` are the empty policy.
fn parse_document(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if s.trim().is_empty() => Some(Value::Object(Map::new())),
        Value::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.clone()),
    }
}

fn sort_by_rendering(items: &mut [Value]) {
    items.sort_by_cached_key(|v| v.to_string());
}

fn canonical_statement(statement: &Value) -> Value {
    let Value::Object(fields) = statement else {
        return statement.clone();
    };

    let fields = fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(_) if LIST_KEYS.contains(&key.as_str()) => {
                    Value::Array(vec![value.clone()])
                }
                Value::Array(items) if LIST_KEYS.contains(&key.as_str()) => {
                    let mut items = items.clone();
                    sort_by_rendering(&mut items);
                    Value::Array(items)
                }
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect();

    Value::Object(fields)
}

fn canonical(document: Value) -> Value {
    let mut fields = match document {
        Value::Object(fields) => fields,
        other => return other,
    };

    if let Some(statements) = fields.remove("Statement") {
        let mut statements: Vec<Value> = match statements {
            Value::Array(items) => items.iter().map(canonical_statement).collect(),
            single => vec![canonical_statement(&single)],
        };
        sort_by_rendering(&mut statements);
        fields.insert("Statement".to_string(), Value::Array(statements));
    }

    Value::Object(fields)
}

/// Whether two policy documents grant the same thing.
///
/// Either side may be an object or a string holding one. Key order, a lone
/// statement versus a one-element statement list, a string versus a
/// one-element list for action and resource keys, and statement order are
/// all insignificant. Documents that do not parse compare verbatim.
pub fn documents_equivalent(a: &Value, b: &Value) -> bool {
    match (parse_document(a), parse_document(b)) {
        (Some(a), Some(b)) => canonical(a) == canonical(b),
        _ => a == b,
    }
}

fn document(desired: &DeclaredState) -> Result<Value> {
    let raw = desired
        .get("policy_file_content")
        .ok_or_else(|| ReconcileError::invalid("policy_file_content", "a value is required"))?;

    match parse_document(raw) {
        Some(doc @ Value::Object(_)) => Ok(doc),
        _ => Err(ReconcileError::invalid(
            "policy_file_content",
            "must be a JSON object",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct PolicyData {
    policy: PolicyRecord,
}

#[derive(Debug, Deserialize)]
struct PolicyRecord {
    name: String,
    #[serde(default)]
    content: Value,
}

pub struct AccessPolicyReconciler {
    transport: Arc<dyn Transport>,
}

impl AccessPolicyReconciler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn upload_body(desired: &DeclaredState) -> Result<Value> {
        Ok(json!({
            "policy_name": desired.require_str("policy_name")?,
            "policy_file_content": document(desired)?,
        }))
    }
}

#[async_trait]
impl EntityReconciler for AccessPolicyReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::AccessPolicy
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn validate(&self, desired: &DeclaredState) -> Result<()> {
        document(desired).map(|_| ())
    }

    async fn create(&self, desired: &DeclaredState) -> Result<Resource> {
        let name = desired.require_str("policy_name")?;
        info!(policy = %name, "Creating S3 policy");

        let body = Self::upload_body(desired)?;
        self.transport
            .send(Method::POST, "s3/policies", Some(&body))
            .await?;

        Ok(Resource::new(name, desired.clone()))
    }

    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState> {
        let payload = self
            .transport
            .send(Method::GET, &format!("s3/policies/{id}"), None)
            .await
            .map_err(|e| absent_as_not_found(self.kind(), id, e))?;
        let record: Envelope<PolicyData> = decode(&payload, "s3 policy")?;
        let policy = record.data.policy;

        let mut state = known.clone();
        state.set("policy_name", policy.name);

        // Keep the declared rendering when it means the same thing.
        let unchanged = known
            .get("policy_file_content")
            .is_some_and(|declared| documents_equivalent(declared, &policy.content));
        if !unchanged {
            state.set("policy_file_content", policy.content);
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
        if !changes.contains("policy_file_content") {
            return Ok(Vec::new());
        }

        Ok(vec![SubCall::post(
            "document",
            "s3/policies",
            Self::upload_body(desired)?,
            vec!["policy_file_content"],
        )])
    }

    async fn delete(&self, id: &str, _known: &DeclaredState) -> Result<()> {
        info!(policy = %id, "Deleting S3 policy");
        self.transport
            .send(Method::DELETE, &format!("s3/policies/{id}"), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ScriptedTransport;

    const READ_ONLY: &str = r#"{
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": ["s3:ListBucket", "s3:GetObject"],
            "Resource": "arn:aws:s3:::logs/*"
        }]
    }"#;

    fn policy() -> DeclaredState {
        DeclaredState::new()
            .with("policy_name", "read-logs")
            .with("policy_file_content", READ_ONLY)
    }

    #[test]
    fn test_equivalent_documents() {
        let reordered = json!({
            "Statement": {
                "Resource": ["arn:aws:s3:::logs/*"],
                "Action": ["s3:GetObject", "s3:ListBucket"],
                "Effect": "Allow"
            },
            "Version": "2012-10-17"
        });
        assert!(documents_equivalent(&json!(READ_ONLY), &reordered));

        assert!(documents_equivalent(&json!(""), &json!("{}")));
        assert!(documents_equivalent(&json!("  "), &json!({})));
    }

    #[test]
    fn test_statement_order_is_insignificant() {
        let a = json!({"Statement": [{"Sid": "a"}, {"Sid": "b"}]});
        let b = json!({"Statement": [{"Sid": "b"}, {"Sid": "a"}]});
        assert!(documents_equivalent(&a, &b));
    }

    #[test]
    fn test_different_documents() {
        let deny = READ_ONLY.replace("Allow", "Deny");
        assert!(!documents_equivalent(&json!(READ_ONLY), &json!(deny)));
        assert!(!documents_equivalent(&json!("{broken"), &json!("{}")));
        assert!(documents_equivalent(&json!("{broken"), &json!("{broken")));
    }

    #[test]
    fn test_validate_requires_an_object() {
        let reconciler = AccessPolicyReconciler::new(Arc::new(ScriptedTransport::new()));
        reconciler.validate(&policy()).unwrap();
        assert!(
            reconciler
                .validate(&policy().with("policy_file_content", "[1, 2]"))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_create_sends_parsed_document() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(Method::POST, "s3/policies", json!({"data": {}}));
        let reconciler = AccessPolicyReconciler::new(transport.clone());

        let created = reconciler.create(&policy()).await.unwrap();
        assert_eq!(created.id, "read-logs");

        let body = transport.calls()[0].body.clone().unwrap();
        assert_eq!(body["policy_name"], json!("read-logs"));
        assert_eq!(body["policy_file_content"]["Version"], json!("2012-10-17"));
    }

    #[tokio::test]
    async fn test_read_keeps_equivalent_declaration() {
        let transport = Arc::new(ScriptedTransport::new());
        let content: Value = serde_json::from_str(READ_ONLY).unwrap();
        transport.reply(
            Method::GET,
            "s3/policies/read-logs",
            json!({"data": {"policy": {"name": "read-logs", "content": content}}}),
        );
        let reconciler = AccessPolicyReconciler::new(transport.clone());

        let state = reconciler.read("read-logs", &policy()).await.unwrap();
        assert_eq!(state, policy());
    }

    #[tokio::test]
    async fn test_read_reports_drifted_document() {
        let transport = Arc::new(ScriptedTransport::new());
        let drifted = json!({"Version": "2012-10-17", "Statement": []});
        transport.reply(
            Method::GET,
            "s3/policies/read-logs",
            json!({"data": {"policy": {"name": "read-logs", "content": drifted.clone()}}}),
        );
        let reconciler = AccessPolicyReconciler::new(transport.clone());

        let state = reconciler.read("read-logs", &policy()).await.unwrap();
        assert_eq!(state.get("policy_file_content"), Some(&drifted));
    }

    #[tokio::test]
    async fn test_equivalent_rewrite_issues_no_update() {
        let reconciler = AccessPolicyReconciler::new(Arc::new(ScriptedTransport::new()));
        let previous = policy();
        let desired = policy().with(
            "policy_file_content",
            serde_json::from_str::<Value>(READ_ONLY).unwrap(),
        );
        let changes = ChangeSet::between(EntityKind::AccessPolicy, &previous, &desired);

        assert!(changes.is_empty());
        assert!(
            reconciler
                .plan_update("read-logs", &previous, &desired, &changes)
                .unwrap()
                .is_empty()
        );
    }
}
