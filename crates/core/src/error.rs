use std::fmt;

use crate::ResourceId;

/// Document and parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("invalid flight output: {0}")]
    InvalidOutput(String),
    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Serialization(e.to_string()) }
}

/// Outcome that callers treat as success but surface in logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Warning(pub String);

impl Warning {
    pub fn new(msg: impl Into<String>) -> Self { Self(msg.into()) }
}

/// True when the error chain carries a [`Warning`].
pub fn is_warning(err: &anyhow::Error) -> bool { err.chain().any(|e| e.downcast_ref::<Warning>().is_some()) }

/// Per-resource failures collected from a batch, ordered and deduplicated by identity.
#[derive(Debug, Default)]
pub struct MultiError {
    heading: String,
    errors: Vec<(ResourceId, String)>,
}

impl MultiError {
    pub fn new(heading: impl Into<String>) -> Self { Self { heading: heading.into(), errors: Vec::new() } }

    pub fn push(&mut self, id: ResourceId, err: impl fmt::Display) {
        if self.errors.iter().any(|(x, _)| *x == id) {
            return;
        }
        self.errors.push((id, err.to_string()));
    }

    pub fn len(&self) -> usize { self.errors.len() }
    pub fn is_empty(&self) -> bool { self.errors.is_empty() }
    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> { self.errors.iter().map(|(id, _)| id) }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(mut self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            return Ok(());
        }
        self.errors.sort_by(|a, b| a.0.cmp(&b.0));
        Err(self)
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.heading)?;
        for (id, e) in &self.errors {
            write!(f, "\n  - {}: {}", id, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resource;
    use anyhow::Context;

    fn id(name: &str) -> ResourceId {
        Resource::from_value(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}}))
            .unwrap()
            .id()
    }

    #[test]
    fn warning_survives_context_wrapping() {
        let err = anyhow::Error::new(Warning::new("no-op")).context("takeoff");
        assert!(is_warning(&err));
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("boom")).context("takeoff");
        assert!(!is_warning(&err.unwrap_err()));
    }

    #[test]
    fn multi_error_is_sorted_and_deduplicated() {
        let mut m = MultiError::new("failed to apply");
        m.push(id("b"), "first");
        m.push(id("a"), "second");
        m.push(id("b"), "dup");
        let err = m.into_result().unwrap_err();
        assert_eq!(err.len(), 2);
        let s = err.to_string();
        assert!(s.starts_with("failed to apply:"));
        assert!(s.find("configmap/a").unwrap() < s.find("configmap/b").unwrap(), "{}", s);
        assert!(!s.contains("dup"));
        assert!(MultiError::new("x").into_result().is_ok());
    }
}
