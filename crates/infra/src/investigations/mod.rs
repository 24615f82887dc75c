//! Read access to investigations and their findings.
//!
//! Both tables belong to the surrounding application; the job pipeline only
//! checks that an investigation exists and reads its findings to build prompts.

mod postgres;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;

use casefile_core::{Finding, InvestigationId};

pub use postgres::PostgresInvestigationReader;

/// Investigation read error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvestigationReadError {
    #[error("investigation store unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of investigations and their findings.
#[async_trait]
pub trait InvestigationReader: Send + Sync {
    async fn investigation_exists(&self, id: InvestigationId) -> Result<bool, InvestigationReadError>;

    /// Findings of an investigation ordered by collection time (oldest first).
    async fn findings(&self, id: InvestigationId) -> Result<Vec<Finding>, InvestigationReadError>;
}

/// In-memory investigation data for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryInvestigationReader {
    investigations: RwLock<BTreeSet<InvestigationId>>,
    findings: RwLock<BTreeMap<InvestigationId, Vec<Finding>>>,
}

impl InMemoryInvestigationReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_investigation(&self, id: InvestigationId) -> Result<(), InvestigationReadError> {
        self.investigations.write().map_err(|_| poisoned())?.insert(id);
        Ok(())
    }

    /// Add a finding, registering its investigation if needed.
    pub fn add_finding(&self, finding: Finding) -> Result<(), InvestigationReadError> {
        self.add_investigation(finding.investigation_id)?;
        self.findings
            .write()
            .map_err(|_| poisoned())?
            .entry(finding.investigation_id)
            .or_default()
            .push(finding);
        Ok(())
    }

    pub fn with_findings(
        findings: impl IntoIterator<Item = Finding>,
    ) -> Result<Self, InvestigationReadError> {
        let reader = Self::new();
        for finding in findings {
            reader.add_finding(finding)?;
        }
        Ok(reader)
    }
}

fn poisoned() -> InvestigationReadError {
    InvestigationReadError::Unavailable("investigation store lock poisoned".into())
}

#[async_trait]
impl InvestigationReader for InMemoryInvestigationReader {
    async fn investigation_exists(&self, id: InvestigationId) -> Result<bool, InvestigationReadError> {
        Ok(self.investigations.read().map_err(|_| poisoned())?.contains(&id))
    }

    async fn findings(&self, id: InvestigationId) -> Result<Vec<Finding>, InvestigationReadError> {
        let mut findings = self
            .findings
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .unwrap_or_default();
        findings.sort_by_key(|f| (f.collected_at, f.id));
        Ok(findings)
    }
}
