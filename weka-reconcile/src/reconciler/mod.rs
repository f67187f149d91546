//! Reconcilers for the different entity kinds.
//!
//! Each reconciler implements Create/Read/Update/Delete for one kind in
//! terms of the [`Transport`] and the field policy. Updates are described as
//! an ordered list of sub-calls and run by [`apply_update`], which stops at
//! the first failing call and reports what the earlier calls committed.

pub mod bucket;
pub mod filesystem;
pub mod filesystem_group;
pub mod kms;
pub mod s3_policy;
pub mod user;
pub mod user_policy;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::apply::{PartialApply, SubCall};
use crate::error::{ReconcileError, Result, UpdateFailure};
use crate::policy::{self, ChangeSet, EntityKind};
use crate::state::{DeclaredState, Resource};
use crate::transport::Transport;

pub use bucket::BucketReconciler;
pub use filesystem::FilesystemReconciler;
pub use filesystem_group::FilesystemGroupReconciler;
pub use kms::KmsReconciler;
pub use s3_policy::AccessPolicyReconciler;
pub use user::UserReconciler;
pub use user_policy::UserPolicyReconciler;

/// Create/Read/Update/Delete for one entity kind.
///
/// Inputs are already normalized by the driver: defaults applied, Computed
/// fields stripped, and boundary validation passed.
#[async_trait]
pub trait EntityReconciler: Send + Sync {
    fn kind(&self) -> EntityKind;

    fn transport(&self) -> &dyn Transport;

    /// Kind-specific validation beyond the field table. Runs before any
    /// remote call.
    fn validate(&self, _desired: &DeclaredState) -> Result<()> {
        Ok(())
    }

    /// Create the entity; returns its identifier and state including any
    /// Computed fields the create response carried.
    async fn create(&self, desired: &DeclaredState) -> Result<Resource>;

    /// Read the current remote state, overlaid on `known`.
    ///
    /// Returns [`ReconcileError::NotFound`] when the entity is gone.
    async fn read(&self, id: &str, known: &DeclaredState) -> Result<DeclaredState>;

    /// Sub-calls realizing `changes`, in the order they must be issued.
    fn plan_update(
        &self,
        id: &str,
        previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> Result<Vec<SubCall>>;

    /// Fold a successful sub-call's response into the actual state.
    fn absorb_update_response(
        &self,
        _call: &SubCall,
        _payload: &[u8],
        _actual: &mut DeclaredState,
    ) -> Result<()> {
        Ok(())
    }

    async fn update(
        &self,
        id: &str,
        previous: &DeclaredState,
        desired: &DeclaredState,
        changes: &ChangeSet,
    ) -> std::result::Result<DeclaredState, UpdateFailure> {
        apply_update(self, id, previous, desired, changes).await
    }

    async fn delete(&self, id: &str, known: &DeclaredState) -> Result<()>;
}

/// Run an in-place update as an ordered sequence of sub-calls.
///
/// A change to a CreateOnly or ForceReplace field is rejected before
/// anything is sent. On failure of sub-call k, the returned actual state
/// holds the fields of sub-calls 1..k-1.
pub async fn apply_update<R: EntityReconciler + ?Sized>(
    reconciler: &R,
    id: &str,
    previous: &DeclaredState,
    desired: &DeclaredState,
    changes: &ChangeSet,
) -> std::result::Result<DeclaredState, UpdateFailure> {
    let kind = reconciler.kind();

    if let Some(field) = policy::immutable_change(kind, changes) {
        return Err(UpdateFailure::untouched(
            ReconcileError::ImmutableFieldChanged {
                kind,
                field: field.to_string(),
            },
            id,
            previous,
        ));
    }

    let calls = reconciler
        .plan_update(id, previous, desired, changes)
        .map_err(|e| UpdateFailure::untouched(e, id, previous))?;

    let mut marker = PartialApply::new(&calls);
    let mut actual = previous.clone();

    for (idx, call) in calls.iter().enumerate() {
        debug!(kind = %kind, id = %id, call = call.name, path = %call.path, "Issuing update sub-call");

        let payload = match reconciler
            .transport()
            .send(call.method.clone(), &call.path, call.body.as_ref())
            .await
        {
            Ok(payload) => payload,
            Err(error) => {
                marker.record_failure(idx);
                warn!(
                    kind = %kind,
                    id = %id,
                    call = call.name,
                    committed = ?marker.committed_fields(),
                    skipped = ?marker.pending(),
                    "Update sub-call failed: {}",
                    error
                );
                return Err(UpdateFailure {
                    error,
                    actual: Some(Resource::new(id, actual)),
                });
            }
        };

        marker.record_success(idx, desired, &mut actual);

        if let Err(error) = reconciler.absorb_update_response(call, &payload, &mut actual) {
            return Err(UpdateFailure {
                error,
                actual: Some(Resource::new(id, actual)),
            });
        }
    }

    Ok(actual)
}

/// Translate a direct-lookup failure meaning "absent" into [`ReconcileError::NotFound`].
pub(crate) fn absent_as_not_found(kind: EntityKind, id: &str, error: ReconcileError) -> ReconcileError {
    if error.is_not_found() {
        ReconcileError::NotFound {
            kind,
            id: id.to_string(),
        }
    } else {
        error
    }
}

/// List-scan lookup for endpoints without a single-item GET.
///
/// Linear in the collection size; the whole collection is assumed to come
/// back in one response.
pub(crate) fn scan<'a, T>(
    kind: EntityKind,
    id: &str,
    items: &'a [T],
    identity: impl Fn(&T) -> &str,
) -> Result<&'a T> {
    debug!(kind = %kind, id = %id, listed = items.len(), "Scanning collection");
    items
        .iter()
        .find(|item| identity(item) == id)
        .ok_or_else(|| ReconcileError::NotFound {
            kind,
            id: id.to_string(),
        })
}
