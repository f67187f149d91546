//! File-backed reference host.
//!
//! Reads a desired-entity file, tracks what exists in a state file, and
//! drives Create/Read/Update/Delete through the [`Driver`]. The state file
//! is rewritten after every entity so committed progress survives a
//! failure later in the run.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::driver::Driver;
use crate::policy::{ChangePlan, EntityKind};
use crate::state::{DeclaredState, Resource};

/// KMS secrets that may come from the environment instead of the desired file.
pub const KMS_ENV_DEFAULTS: &[(&str, &str)] = &[
    ("token", "WEKA_VAULT_TOKEN"),
    ("key_uid", "WEKA_VAULT_KEY_UID"),
    ("client_cert_pem", "WEKA_VAULT_CLIENT_CERT"),
    ("client_key_pem", "WEKA_VAULT_CLIENT_KEY"),
    ("ca_cert_pem", "WEKA_VAULT_CA_CERT"),
];

/// One entry of the desired file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredEntity {
    pub kind: EntityKind,
    /// Host-side handle, unique within the file.
    pub name: String,
    #[serde(default)]
    pub fields: DeclaredState,
}

/// An entity the host created and still tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub fields: DeclaredState,
}

impl TrackedEntity {
    fn from_resource(kind: EntityKind, resource: Resource) -> Self {
        Self {
            kind,
            id: resource.id,
            fields: resource.state,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub entities: BTreeMap<String, TrackedEntity>,
}

/// Load the desired file: a JSON list of `{kind, name, fields}`.
pub fn load_desired(path: &Path) -> Result<Vec<DesiredEntity>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read desired file {}", path.display()))?;
    let desired: Vec<DesiredEntity> = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse desired file {}", path.display()))?;

    let mut seen = HashSet::new();
    for entity in &desired {
        if !seen.insert(entity.name.as_str()) {
            bail!("Duplicate entity name in desired file: {}", entity.name);
        }
    }
    Ok(desired)
}

/// Fill absent KMS secrets from `lookup`, keyed by environment variable name.
pub fn apply_env_defaults(desired: &mut [DesiredEntity], lookup: impl Fn(&str) -> Option<String>) {
    for entity in desired
        .iter_mut()
        .filter(|e| e.kind == EntityKind::KmsConfig)
    {
        for (field, var) in KMS_ENV_DEFAULTS {
            if entity.fields.contains(field) {
                continue;
            }
            if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
                entity.fields.set(field, value);
            }
        }
    }
}

/// Persisted host state, saved with write-to-temp and rename.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing state file is an empty one.
    pub fn load(&self) -> Result<StateFile> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("Failed to parse state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read state file {}", self.path.display())),
        }
    }

    pub fn save(&self, state: &StateFile) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let bytes = serde_json::to_vec_pretty(state).context("Failed to encode state file")?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))?;
        Ok(())
    }
}

/// What happened to one entity during an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// Tracked but gone remotely, so created again.
    Recreated,
    Updated,
    Replaced,
    Unchanged,
    Deleted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReport {
    pub name: String,
    pub kind: EntityKind,
    pub outcome: Outcome,
}

impl fmt::Display for EntityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Failed(reason) => write!(f, "{} ({}): failed: {reason}", self.name, self.kind),
            outcome => write!(f, "{} ({}): {outcome:?}", self.name, self.kind),
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub entities: Vec<EntityReport>,
}

impl ApplyReport {
    fn record(&mut self, name: &str, kind: EntityKind, outcome: Outcome) {
        self.entities.push(EntityReport {
            name: name.to_string(),
            kind,
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityReport> {
        self.entities
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
    }

    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.entities
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }
}

/// Dependents are torn down before what they depend on.
fn teardown_rank(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::UserPolicyBinding => 0,
        EntityKind::AccessPolicy => 1,
        EntityKind::ObjectStoreBucket => 2,
        EntityKind::Filesystem => 3,
        EntityKind::FilesystemGroup => 4,
        EntityKind::KmsConfig => 5,
        EntityKind::User => 6,
    }
}

/// Tracked entries absent from the desired list, in teardown order.
fn orphans(state: &StateFile, desired: &[DesiredEntity]) -> Vec<(String, TrackedEntity)> {
    let wanted: HashSet<&str> = desired.iter().map(|e| e.name.as_str()).collect();
    let mut orphans: Vec<_> = state
        .entities
        .iter()
        .filter(|(name, _)| !wanted.contains(name.as_str()))
        .map(|(name, tracked)| (name.clone(), tracked.clone()))
        .collect();
    orphans.sort_by_key(|(_, tracked)| teardown_rank(tracked.kind));
    orphans
}

/// Converge every desired entity, then delete tracked entities that are no
/// longer desired.
///
/// Entities are processed sequentially in file order. A failing entity is
/// reported and the run continues; only state file errors abort.
pub async fn apply(
    driver: &Driver,
    desired: &[DesiredEntity],
    store: &StateStore,
) -> Result<ApplyReport> {
    let mut state = store.load()?;
    let mut report = ApplyReport::default();

    for entity in desired {
        let tracked = state.entities.get(&entity.name).cloned();
        let outcome = converge(driver, entity, tracked, &mut state).await;

        if let Outcome::Failed(reason) = &outcome {
            error!(name = %entity.name, kind = %entity.kind, "Reconciliation failed: {}", reason);
        } else {
            info!(name = %entity.name, kind = %entity.kind, outcome = ?outcome, "Reconciled entity");
        }
        report.record(&entity.name, entity.kind, outcome);
        store.save(&state)?;
    }

    for (name, tracked) in orphans(&state, desired) {
        let outcome = match driver.delete(tracked.kind, &tracked.id, &tracked.fields).await {
            Ok(()) => {
                state.entities.remove(&name);
                Outcome::Deleted
            }
            // Only a read can prove the entity is gone.
            Err(e) => match driver.read(tracked.kind, &tracked.id, &tracked.fields).await {
                Ok(None) => {
                    warn!(name = %name, id = %tracked.id, "Entity already gone remotely");
                    state.entities.remove(&name);
                    Outcome::Deleted
                }
                Ok(Some(_)) | Err(_) => Outcome::Failed(e.to_string()),
            },
        };
        report.record(&name, tracked.kind, outcome);
        store.save(&state)?;
    }

    Ok(report)
}

async fn converge(
    driver: &Driver,
    entity: &DesiredEntity,
    tracked: Option<TrackedEntity>,
    state: &mut StateFile,
) -> Outcome {
    let tracked = match tracked {
        Some(tracked) if tracked.kind == entity.kind => tracked,
        Some(tracked) => {
            // Same handle, different kind: the old entity goes first.
            info!(name = %entity.name, from = %tracked.kind, to = %entity.kind, "Entity kind changed");
            if let Err(e) = driver.delete(tracked.kind, &tracked.id, &tracked.fields).await {
                return Outcome::Failed(e.to_string());
            }
            state.entities.remove(&entity.name);
            return create(driver, entity, state, Outcome::Created).await;
        }
        None => return create(driver, entity, state, Outcome::Created).await,
    };

    let actual = match driver.read(entity.kind, &tracked.id, &tracked.fields).await {
        Ok(Some(actual)) => actual,
        Ok(None) => {
            state.entities.remove(&entity.name);
            return create(driver, entity, state, Outcome::Recreated).await;
        }
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    let plan = match driver.plan(entity.kind, &actual.state, &entity.fields) {
        Ok(plan) => plan,
        Err(e) => {
            state.entities.insert(
                entity.name.clone(),
                TrackedEntity::from_resource(entity.kind, actual),
            );
            return Outcome::Failed(e.to_string());
        }
    };

    match driver
        .update(entity.kind, &actual.id, &actual.state, &entity.fields)
        .await
    {
        Ok(resource) => {
            state.entities.insert(
                entity.name.clone(),
                TrackedEntity::from_resource(entity.kind, resource),
            );
            match plan {
                ChangePlan::NoOp => Outcome::Unchanged,
                ChangePlan::Update { .. } => Outcome::Updated,
                ChangePlan::Replace { .. } => Outcome::Replaced,
            }
        }
        Err(failure) => {
            match failure.actual {
                Some(resource) => {
                    state.entities.insert(
                        entity.name.clone(),
                        TrackedEntity::from_resource(entity.kind, resource),
                    );
                }
                None => {
                    state.entities.remove(&entity.name);
                }
            }
            Outcome::Failed(failure.error.to_string())
        }
    }
}

async fn create(
    driver: &Driver,
    entity: &DesiredEntity,
    state: &mut StateFile,
    success: Outcome,
) -> Outcome {
    match driver.create(entity.kind, &entity.fields).await {
        Ok(resource) => {
            state.entities.insert(
                entity.name.clone(),
                TrackedEntity::from_resource(entity.kind, resource),
            );
            success
        }
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

/// A planned action for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    /// Tracked, but the remote entity is gone.
    Recreate,
    Change(ChangePlan),
    Delete,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntity {
    pub name: String,
    pub kind: EntityKind,
    pub action: PlannedAction,
}

impl fmt::Display for PlannedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): ", self.name, self.kind)?;
        match &self.action {
            PlannedAction::Create => f.write_str("create"),
            PlannedAction::Recreate => f.write_str("recreate (gone remotely)"),
            PlannedAction::Change(ChangePlan::NoOp) => f.write_str("no changes"),
            PlannedAction::Change(ChangePlan::Update { fields }) => {
                write!(f, "update in place [{}]", fields.join(", "))
            }
            PlannedAction::Change(ChangePlan::Replace { fields }) => {
                write!(f, "replace [{}]", fields.join(", "))
            }
            PlannedAction::Delete => f.write_str("delete"),
            PlannedAction::Invalid(reason) => write!(f, "invalid: {reason}"),
        }
    }
}

/// Classify what [`apply`] would do, without mutating anything remotely or
/// in the state file. Tracked entities are still read.
pub async fn plan(
    driver: &Driver,
    desired: &[DesiredEntity],
    store: &StateStore,
) -> Result<Vec<PlannedEntity>> {
    let state = store.load()?;
    let mut planned = Vec::with_capacity(desired.len());

    for entity in desired {
        let action = match state.entities.get(&entity.name) {
            Some(tracked) if tracked.kind == entity.kind => {
                match driver.read(entity.kind, &tracked.id, &tracked.fields).await {
                    Ok(Some(actual)) => match driver.plan(entity.kind, &actual.state, &entity.fields) {
                        Ok(plan) => PlannedAction::Change(plan),
                        Err(e) => PlannedAction::Invalid(e.to_string()),
                    },
                    Ok(None) => PlannedAction::Recreate,
                    Err(e) => return Err(e).with_context(|| format!("Failed to read {}", entity.name)),
                }
            }
            _ => match driver.prepare(entity.kind, &entity.fields) {
                Ok(_) => PlannedAction::Create,
                Err(e) => PlannedAction::Invalid(e.to_string()),
            },
        };

        planned.push(PlannedEntity {
            name: entity.name.clone(),
            kind: entity.kind,
            action,
        });
    }

    for (name, tracked) in orphans(&state, desired) {
        planned.push(PlannedEntity {
            name,
            kind: tracked.kind,
            action: PlannedAction::Delete,
        });
    }

    Ok(planned)
}
