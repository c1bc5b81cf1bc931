//! Label selectors.

use std::collections::BTreeMap;

/// A single label requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The key is present, whatever its value.
    Exists(String),
    /// The key is absent.
    DoesNotExist(String),
    /// The key is present with exactly this value.
    Equals(String, String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::DoesNotExist(key) => !labels.contains_key(key),
            Requirement::Equals(key, value) => labels.get(key) == Some(value),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    pub fn does_not_exist(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::DoesNotExist(key.into()));
        self
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}
