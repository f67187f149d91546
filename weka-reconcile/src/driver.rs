//! Reconciliation driver.
//!
//! Entry point for the host: normalizes and validates declarations, decides
//! between replacement and in-place update, and delegates to the reconciler
//! for the entity kind. Every operation is sequential; nothing is retried.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use crate::error::{ReconcileError, Result, UpdateFailure};
use crate::policy::{self, ChangePlan, ChangeSet, EntityKind, LAST_UPDATED};
use crate::reconciler::{
    AccessPolicyReconciler, BucketReconciler, EntityReconciler, FilesystemGroupReconciler,
    FilesystemReconciler, KmsReconciler, UserPolicyReconciler, UserReconciler,
};
use crate::session::Session;
use crate::state::{DeclaredState, Resource};
use crate::transport::{HttpTransport, Transport};

/// Reconciles declared entities against one Weka cluster.
pub struct Driver {
    user: UserReconciler,
    kms: KmsReconciler,
    filesystem: FilesystemReconciler,
    filesystem_group: FilesystemGroupReconciler,
    bucket: BucketReconciler,
    access_policy: AccessPolicyReconciler,
    user_policy: UserPolicyReconciler,
}

impl Driver {
    pub fn new(transport: Arc<dyn Transport>, org: &str) -> Self {
        Self {
            user: UserReconciler::new(transport.clone(), org),
            kms: KmsReconciler::new(transport.clone()),
            filesystem: FilesystemReconciler::new(transport.clone()),
            filesystem_group: FilesystemGroupReconciler::new(transport.clone()),
            bucket: BucketReconciler::new(transport.clone()),
            access_policy: AccessPolicyReconciler::new(transport.clone()),
            user_policy: UserPolicyReconciler::new(transport),
        }
    }

    /// Driver over the reqwest transport of an authenticated session.
    pub fn from_session(http: reqwest::Client, session: Session) -> Self {
        let org = session.org().to_string();
        let transport = HttpTransport::new(http, Arc::new(session));
        Self::new(Arc::new(transport), &org)
    }

    fn reconciler(&self, kind: EntityKind) -> &dyn EntityReconciler {
        match kind {
            EntityKind::User => &self.user,
            EntityKind::KmsConfig => &self.kms,
            EntityKind::Filesystem => &self.filesystem,
            EntityKind::FilesystemGroup => &self.filesystem_group,
            EntityKind::ObjectStoreBucket => &self.bucket,
            EntityKind::AccessPolicy => &self.access_policy,
            EntityKind::UserPolicyBinding => &self.user_policy,
        }
    }

    /// Normalize a declaration and run all boundary validation on it.
    ///
    /// Drops Computed and unknown fields, applies defaults, then checks the
    /// field table and the kind's own rules.
    pub fn prepare(&self, kind: EntityKind, desired: &DeclaredState) -> Result<DeclaredState> {
        let declared = policy::declared_only(kind, desired);
        policy::validate(kind, &declared)?;
        self.reconciler(kind).validate(&declared)?;
        Ok(declared)
    }

    pub async fn create(&self, kind: EntityKind, desired: &DeclaredState) -> Result<Resource> {
        let declared = self.prepare(kind, desired)?;
        info!(kind = %kind, state = %declared.redacted(kind), "Creating entity");

        let created = self.reconciler(kind).create(&declared).await?;
        info!(kind = %kind, id = %created.id, "Created entity");
        Ok(created)
    }

    /// Current remote state of an entity, or `None` when it no longer exists.
    pub async fn read(
        &self,
        kind: EntityKind,
        id: &str,
        known: &DeclaredState,
    ) -> Result<Option<Resource>> {
        match self.reconciler(kind).read(id, known).await {
            Ok(state) => Ok(Some(Resource::new(id, state))),
            Err(ReconcileError::NotFound { .. }) => {
                warn!(kind = %kind, id = %id, "Entity no longer exists remotely");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Classify the change from `previous` to `desired` without touching
    /// the remote side.
    ///
    /// A change to a CreateOnly field is an error here, as it would be on
    /// Update.
    pub fn plan(
        &self,
        kind: EntityKind,
        previous: &DeclaredState,
        desired: &DeclaredState,
    ) -> Result<ChangePlan> {
        let declared = self.prepare(kind, desired)?;
        let changes = ChangeSet::between(kind, previous, &declared);
        let plan = policy::classify(kind, &changes);

        if let ChangePlan::Update { .. } = plan
            && let Some(field) = policy::immutable_change(kind, &changes)
        {
            return Err(ReconcileError::ImmutableFieldChanged {
                kind,
                field: field.to_string(),
            });
        }
        Ok(plan)
    }

    /// Converge an existing entity from `previous` to `desired`.
    ///
    /// On failure the returned [`UpdateFailure`] says what the remote side
    /// now holds, including sub-changes committed before the failing call.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        previous: &DeclaredState,
        desired: &DeclaredState,
    ) -> std::result::Result<Resource, UpdateFailure> {
        let declared = self
            .prepare(kind, desired)
            .map_err(|e| UpdateFailure::untouched(e, id, previous))?;
        let changes = ChangeSet::between(kind, previous, &declared);

        match policy::classify(kind, &changes) {
            ChangePlan::NoOp => Ok(Resource::new(id, previous.clone())),
            ChangePlan::Replace { fields } => {
                info!(kind = %kind, id = %id, fields = ?fields, "Replacing entity");
                self.replace(kind, id, previous, &declared).await
            }
            ChangePlan::Update { fields } => {
                info!(kind = %kind, id = %id, fields = ?fields, "Updating entity");
                let mut actual = self
                    .reconciler(kind)
                    .update(id, previous, &declared, &changes)
                    .await?;
                actual.set(
                    LAST_UPDATED,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                );
                Ok(Resource::new(id, actual))
            }
        }
    }

    /// Delete then create. The new identifier is only returned once the old
    /// entity is gone.
    async fn replace(
        &self,
        kind: EntityKind,
        id: &str,
        previous: &DeclaredState,
        declared: &DeclaredState,
    ) -> std::result::Result<Resource, UpdateFailure> {
        let reconciler = self.reconciler(kind);

        if let Err(error) = reconciler.delete(id, previous).await {
            return Err(UpdateFailure::untouched(error, id, previous));
        }

        match reconciler.create(declared).await {
            Ok(created) => {
                info!(kind = %kind, old_id = %id, id = %created.id, "Replaced entity");
                Ok(created)
            }
            Err(error) => {
                warn!(kind = %kind, id = %id, "Old entity deleted but replacement failed: {}", error);
                Err(UpdateFailure {
                    error,
                    actual: None,
                })
            }
        }
    }

    pub async fn delete(&self, kind: EntityKind, id: &str, known: &DeclaredState) -> Result<()> {
        info!(kind = %kind, id = %id, "Deleting entity");
        self.reconciler(kind).delete(id, known).await
    }
}
