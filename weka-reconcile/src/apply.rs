//! Update sub-calls and per-update progress tracking.

use reqwest::Method;
use serde_json::Value;

use crate::state::DeclaredState;

/// One remote call of a multi-call update.
#[derive(Debug, Clone)]
pub struct SubCall {
    /// Short label for logs, e.g. `quota`.
    pub name: &'static str,
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Declared fields this call makes durable once it succeeds.
    pub fields: Vec<&'static str>,
}

impl SubCall {
    pub fn put(
        name: &'static str,
        path: impl Into<String>,
        body: Value,
        fields: Vec<&'static str>,
    ) -> Self {
        Self {
            name,
            method: Method::PUT,
            path: path.into(),
            body: Some(body),
            fields,
        }
    }

    pub fn post(
        name: &'static str,
        path: impl Into<String>,
        body: Value,
        fields: Vec<&'static str>,
    ) -> Self {
        Self {
            name,
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
struct Step {
    name: &'static str,
    fields: Vec<&'static str>,
    status: StepStatus,
}

/// Partial-apply marker: which sub-calls of one update have been issued and
/// whether they succeeded. Lives for the duration of a single update.
#[derive(Debug, Clone)]
pub struct PartialApply {
    steps: Vec<Step>,
}

impl PartialApply {
    pub fn new(calls: &[SubCall]) -> Self {
        Self {
            steps: calls
                .iter()
                .map(|c| Step {
                    name: c.name,
                    fields: c.fields.clone(),
                    status: StepStatus::Pending,
                })
                .collect(),
        }
    }

    /// Mark step `idx` as succeeded and commit its fields from `desired`
    /// into `actual`.
    pub fn record_success(&mut self, idx: usize, desired: &DeclaredState, actual: &mut DeclaredState) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Succeeded;
        for field in &step.fields {
            actual.copy_field(desired, field);
        }
    }

    pub fn record_failure(&mut self, idx: usize) {
        self.steps[idx].status = StepStatus::Failed;
    }

    pub fn status(&self, idx: usize) -> Option<StepStatus> {
        self.steps.get(idx).map(|s| s.status)
    }

    /// Fields made durable by succeeded steps, in step order.
    pub fn committed_fields(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .flat_map(|s| s.fields.iter().copied())
            .collect()
    }

    /// Names of steps never issued.
    pub fn pending(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.name)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Succeeded)
    }
}
