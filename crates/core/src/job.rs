//! Job submissions.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// A single named input passed to a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: String,
    pub value: String,
}

impl InputParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A unit of work submitted for later execution.
///
/// ## Identity
///
/// `id` is `None` until the job store persists the job. The store assigns it
/// exactly once; callers never set it themselves.
///
/// ## Parameters
///
/// `input_parameters` keeps caller order verbatim. Duplicate names are allowed
/// and are not merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    pub workflow_name: String,
    #[serde(default)]
    pub input_parameters: Vec<InputParameter>,
}

impl Job {
    /// New, not-yet-persisted job for the given workflow.
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            id: None,
            workflow_name: workflow_name.into(),
            input_parameters: Vec::new(),
        }
    }

    /// Append an input parameter (builder style).
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.input_parameters.push(InputParameter::new(name, value));
        self
    }

    pub fn with_parameters<I>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = InputParameter>,
    {
        self.input_parameters.extend(params);
        self
    }

    /// Check the structural requirements for insertion.
    pub fn validate(&self) -> DomainResult<()> {
        if self.workflow_name.trim().is_empty() {
            return Err(DomainError::validation("workflow_name must not be empty"));
        }
        Ok(())
    }

    /// Copy of the parameters re-materialized as plain `{name, value}` pairs.
    pub fn normalized_parameters(&self) -> Vec<InputParameter> {
        self.input_parameters
            .iter()
            .map(|p| InputParameter::new(p.name.as_str(), p.value.as_str()))
            .collect()
    }

    /// Record the store-assigned identity.
    pub fn assign_id(&mut self, id: JobId) {
        self.id = Some(id);
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// First value recorded for `name`, if any.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.input_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}
