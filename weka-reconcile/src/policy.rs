//! Field mutability policy.
//!
//! Every entity kind has a static table describing each of its fields: the
//! semantic type, how a change to it is realized, and whether it is secret.
//! The driver consults this table, and only this table, to turn a pair of
//! declared states into a change set and to decide between an in-place
//! update and a replacement.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReconcileError, Result};
use crate::reconciler::s3_policy::documents_equivalent;
use crate::state::DeclaredState;

/// The closed set of entity kinds this engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    KmsConfig,
    Filesystem,
    FilesystemGroup,
    ObjectStoreBucket,
    AccessPolicy,
    UserPolicyBinding,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::User,
        EntityKind::KmsConfig,
        EntityKind::Filesystem,
        EntityKind::FilesystemGroup,
        EntityKind::ObjectStoreBucket,
        EntityKind::AccessPolicy,
        EntityKind::UserPolicyBinding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::KmsConfig => "kms_config",
            EntityKind::Filesystem => "filesystem",
            EntityKind::FilesystemGroup => "filesystem_group",
            EntityKind::ObjectStoreBucket => "object_store_bucket",
            EntityKind::AccessPolicy => "access_policy",
            EntityKind::UserPolicyBinding => "user_policy_binding",
        }
    }

    /// The field table for this kind.
    pub fn fields(self) -> &'static [FieldDescriptor] {
        match self {
            EntityKind::User => USER_FIELDS,
            EntityKind::KmsConfig => KMS_FIELDS,
            EntityKind::Filesystem => FILESYSTEM_FIELDS,
            EntityKind::FilesystemGroup => FILESYSTEM_GROUP_FIELDS,
            EntityKind::ObjectStoreBucket => BUCKET_FIELDS,
            EntityKind::AccessPolicy => ACCESS_POLICY_FIELDS,
            EntityKind::UserPolicyBinding => USER_POLICY_FIELDS,
        }
    }

    pub fn field(self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields().iter().find(|f| f.name == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a change to a field is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Sent on create; changing it later is rejected.
    CreateOnly,
    /// Sent on create; changing it later replaces the entity.
    ForceReplace,
    /// Sent on create and on update.
    Updatable,
    /// Assigned by the server; never sent, never a change.
    Computed,
}

/// Semantic type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Bool,
    Enum(&'static [&'static str]),
    /// A JSON document, declared either as an object or as a string holding one.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    Str(&'static str),
    Bool(bool),
}

impl DefaultValue {
    fn to_value(self) -> Value {
        match self {
            DefaultValue::Str(s) => Value::from(s),
            DefaultValue::Bool(b) => Value::from(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub ty: FieldType,
    pub mutability: Mutability,
    pub sensitive: bool,
    pub required: bool,
    pub default: Option<DefaultValue>,
}

impl FieldDescriptor {
    const fn new(name: &'static str, ty: FieldType, mutability: Mutability) -> Self {
        Self {
            name,
            ty,
            mutability,
            sensitive: false,
            required: false,
            default: None,
        }
    }

    const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    const fn default_to(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn is_declared(&self) -> bool {
        self.mutability != Mutability::Computed
    }

    /// Check one declared value against the field's type.
    fn check(&self, value: &Value) -> Result<()> {
        let ok = match self.ty {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Enum(allowed) => {
                return match value.as_str() {
                    Some(v) if allowed.contains(&v) => Ok(()),
                    _ => Err(ReconcileError::invalid(
                        self.name,
                        format!("must be one of {}, got {value}", allowed.join(", ")),
                    )),
                };
            }
            FieldType::Json => match value {
                Value::Object(_) => true,
                Value::String(s) if s.trim().is_empty() => true,
                Value::String(s) => {
                    return serde_json::from_str::<Value>(s).map(|_| ()).map_err(|e| {
                        ReconcileError::invalid(self.name, format!("not valid JSON: {e}"))
                    });
                }
                _ => false,
            },
        };

        if ok {
            Ok(())
        } else {
            Err(ReconcileError::invalid(
                self.name,
                format!("expected {:?}, got {value}", self.ty),
            ))
        }
    }

    fn values_equal(&self, a: Option<&Value>, b: Option<&Value>) -> bool {
        match (self.ty, a, b) {
            (FieldType::Json, Some(a), Some(b)) => documents_equivalent(a, b),
            _ => a == b,
        }
    }
}

use FieldType as T;
use Mutability::{Computed, CreateOnly, ForceReplace, Updatable};

pub const USER_ROLES: &[&str] = &["ClusterAdmin", "OrgAdmin", "ReadOnly", "Regular", "S3"];
pub const ANONYMOUS_POLICIES: &[&str] = &["none", "download", "upload", "public"];

/// Stamped by the driver after every successful in-place update.
pub const LAST_UPDATED: &str = "last_updated";

const USER_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("username", T::String, CreateOnly).required(),
    FieldDescriptor::new("password", T::String, Updatable)
        .required()
        .sensitive(),
    FieldDescriptor::new("role", T::Enum(USER_ROLES), Updatable).required(),
    FieldDescriptor::new("posix_uid", T::Int, Updatable),
    FieldDescriptor::new("posix_gid", T::Int, Updatable),
    FieldDescriptor::new("org_id", T::Int, Computed),
    FieldDescriptor::new("source", T::String, Computed),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

const KMS_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("use_vault", T::Bool, Updatable).required(),
    FieldDescriptor::new("base_url", T::String, Updatable),
    FieldDescriptor::new("master_key_name", T::String, Updatable),
    FieldDescriptor::new("token", T::String, Updatable).sensitive(),
    FieldDescriptor::new("server_endpoint", T::String, Updatable),
    FieldDescriptor::new("key_uid", T::String, Updatable).sensitive(),
    FieldDescriptor::new("client_cert_pem", T::String, Updatable).sensitive(),
    FieldDescriptor::new("client_key_pem", T::String, Updatable).sensitive(),
    FieldDescriptor::new("ca_cert_pem", T::String, Updatable).sensitive(),
    FieldDescriptor::new("kms_type", T::String, Computed),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

const FILESYSTEM_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("name", T::String, Updatable).required(),
    FieldDescriptor::new("group_name", T::String, CreateOnly).required(),
    FieldDescriptor::new("total_capacity_gb", T::Int, Updatable).required(),
    FieldDescriptor::new("ssd_capacity_gb", T::Int, Updatable),
    FieldDescriptor::new("obs_name", T::String, CreateOnly),
    FieldDescriptor::new("tiered", T::Bool, CreateOnly).required(),
    FieldDescriptor::new("encrypted", T::Bool, CreateOnly).default_to(DefaultValue::Bool(false)),
    FieldDescriptor::new("auth_required", T::Bool, Updatable)
        .default_to(DefaultValue::Bool(false)),
    FieldDescriptor::new("allow_no_kms", T::Bool, CreateOnly)
        .default_to(DefaultValue::Bool(false)),
    FieldDescriptor::new("group_id", T::String, Computed),
    FieldDescriptor::new("status", T::String, Computed),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

const FILESYSTEM_GROUP_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("name", T::String, Updatable).required(),
    FieldDescriptor::new("target_ssd_retention", T::Int, Updatable).required(),
    FieldDescriptor::new("start_demote", T::Int, Updatable).required(),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

const BUCKET_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("bucket_name", T::String, ForceReplace).required(),
    FieldDescriptor::new("fs_uid", T::String, ForceReplace).required(),
    FieldDescriptor::new("existing_path", T::String, ForceReplace),
    FieldDescriptor::new("anonymous_policy_name", T::Enum(ANONYMOUS_POLICIES), Updatable)
        .default_to(DefaultValue::Str("none")),
    FieldDescriptor::new("hard_quota", T::String, Updatable),
    FieldDescriptor::new("path", T::String, Computed),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

const ACCESS_POLICY_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("policy_name", T::String, ForceReplace).required(),
    FieldDescriptor::new("policy_file_content", T::Json, Updatable).required(),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

const USER_POLICY_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("username", T::String, ForceReplace).required(),
    FieldDescriptor::new("s3_policy_name", T::String, Updatable).required(),
    FieldDescriptor::new(LAST_UPDATED, T::String, Computed),
];

/// Normalize a caller's declaration: drop Computed and unknown fields, then
/// fill in defaults for absent optional fields.
pub fn declared_only(kind: EntityKind, state: &DeclaredState) -> DeclaredState {
    let mut out = DeclaredState::new();
    for field in kind.fields().iter().filter(|f| f.is_declared()) {
        match (state.get(field.name), field.default) {
            (Some(value), _) => out.set(field.name, value.clone()),
            (None, Some(default)) => out.set(field.name, default.to_value()),
            (None, None) => {}
        }
    }
    out
}

/// Boundary validation: required fields, types and enum sets.
///
/// Runs before any remote call.
pub fn validate(kind: EntityKind, state: &DeclaredState) -> Result<()> {
    for field in kind.fields().iter().filter(|f| f.is_declared()) {
        match state.get(field.name) {
            Some(value) => field.check(value)?,
            None if field.required => {
                return Err(ReconcileError::invalid(field.name, "a value is required"));
            }
            None => {}
        }
    }
    Ok(())
}

/// Field names whose declared value differs between two declared states.
///
/// Computed once per update. Computed fields are never part of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    fields: BTreeSet<&'static str>,
}

impl ChangeSet {
    pub fn between(kind: EntityKind, previous: &DeclaredState, desired: &DeclaredState) -> Self {
        let fields = kind
            .fields()
            .iter()
            .filter(|f| f.is_declared())
            .filter(|f| !f.values_equal(previous.get(f.name), desired.get(f.name)))
            .map(|f| f.name)
            .collect();
        Self { fields }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Whether any of `fields` changed.
    pub fn any(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.contains(f))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().copied()
    }

    /// Changed fields among `fields`, in the order given.
    pub fn among(&self, fields: &[&'static str]) -> Vec<&'static str> {
        fields.iter().copied().filter(|f| self.contains(f)).collect()
    }
}

/// What the driver must do to realize a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePlan {
    NoOp,
    /// Delete the entity and create it again from the desired state.
    Replace { fields: Vec<&'static str> },
    /// Issue the entity's update sub-calls.
    Update { fields: Vec<&'static str> },
}

pub fn classify(kind: EntityKind, changes: &ChangeSet) -> ChangePlan {
    let replace: Vec<_> = changes
        .iter()
        .filter(|f| mutability_of(kind, f) == Some(ForceReplace))
        .collect();

    if !replace.is_empty() {
        ChangePlan::Replace { fields: replace }
    } else if changes.is_empty() {
        ChangePlan::NoOp
    } else {
        ChangePlan::Update {
            fields: changes.iter().collect(),
        }
    }
}

/// First changed field that cannot be updated in place.
pub fn immutable_change(kind: EntityKind, changes: &ChangeSet) -> Option<&'static str> {
    changes.iter().find(|f| {
        matches!(
            mutability_of(kind, f),
            Some(CreateOnly) | Some(ForceReplace)
        )
    })
}

fn mutability_of(kind: EntityKind, field: &str) -> Option<Mutability> {
    kind.field(field).map(|f| f.mutability)
}
