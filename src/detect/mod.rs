//! Fraud detection engine: seven independent, stateless detectors, each
//! contributing at most one finding per document. Cross-document patterns
//! (triangulation, splitting, temporal bursts) read a pre-built immutable
//! [`BatchContext`] instead of talking to each other, so detector order
//! never matters and documents can run concurrently.

mod counterparty;
mod misclassification;
mod splitting;
mod temporal;
mod triangulation;
mod underpricing;
mod value;

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use log::debug;
use rust_decimal::Decimal;

use crate::config::AuditConfig;
use crate::reference::{ReferenceTable, RiskRegistry};
use crate::schema::{
    ClassificationResult, DetectorKind, FiscalDocument, FraudFinding,
};

/// Issuer/recipient edge index over one whole batch. Built once before
/// detection starts and never mutated afterwards.
#[derive(Debug, Default)]
pub struct BatchContext {
    /// issuer -> recipient -> chronologically sorted (issued_at, total).
    edges: BTreeMap<String, BTreeMap<String, Vec<(NaiveDateTime, Decimal)>>>,
    /// issuer -> sorted issue timestamps over the batch.
    issuer_timeline: BTreeMap<String, Vec<NaiveDateTime>>,
}

impl BatchContext {
    pub fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = &'a FiscalDocument>,
    {
        let mut context = BatchContext::default();
        for document in documents {
            context
                .issuer_timeline
                .entry(document.issuer_tax_id.clone())
                .or_default()
                .push(document.issued_at);
            if let Some(recipient) = &document.recipient_tax_id {
                context
                    .edges
                    .entry(document.issuer_tax_id.clone())
                    .or_default()
                    .entry(recipient.clone())
                    .or_default()
                    .push((document.issued_at, document.declared_total));
            }
        }
        for targets in context.edges.values_mut() {
            for transactions in targets.values_mut() {
                transactions.sort();
            }
        }
        for timeline in context.issuer_timeline.values_mut() {
            timeline.sort();
        }
        context
    }

    /// All batch documents on the issuer -> recipient edge, oldest first.
    pub fn pair_documents(&self, issuer: &str, recipient: &str) -> &[(NaiveDateTime, Decimal)] {
        self.edges
            .get(issuer)
            .and_then(|targets| targets.get(recipient))
            .map(|transactions| transactions.as_slice())
            .unwrap_or(&[])
    }

    pub fn recipients_of(&self, issuer: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(issuer)
            .into_iter()
            .flat_map(|targets| targets.keys().map(|recipient| recipient.as_str()))
    }

    pub fn issuer_timestamps(&self, issuer: &str) -> &[NaiveDateTime] {
        self.issuer_timeline
            .get(issuer)
            .map(|timeline| timeline.as_slice())
            .unwrap_or(&[])
    }
}

/// Everything a detector may consult for one document. Shared immutably
/// across all seven detectors.
pub struct DetectionInput<'a> {
    pub document: &'a FiscalDocument,
    pub classifications: &'a [ClassificationResult],
    pub context: &'a BatchContext,
    pub reference: &'a ReferenceTable,
    pub registry: &'a RiskRegistry,
    pub config: &'a AuditConfig,
}

/// Runs every detector against one document and collects the findings.
pub fn run_all(input: &DetectionInput<'_>) -> Vec<FraudFinding> {
    let mut findings = Vec::new();
    for kind in DetectorKind::ALL {
        let finding = match kind {
            DetectorKind::Underpricing => underpricing::detect(input),
            DetectorKind::Misclassification => misclassification::detect(input),
            DetectorKind::Triangulation => triangulation::detect(input),
            DetectorKind::Splitting => splitting::detect(input),
            DetectorKind::HighRiskCounterparty => counterparty::detect(input),
            DetectorKind::TemporalAnomaly => temporal::detect(input),
            DetectorKind::ValueInconsistency => value::detect(input),
        };
        if let Some(finding) = finding {
            debug!(
                "{:?} fired: severity {:.1}, confidence {:.2}",
                finding.kind, finding.severity, finding.confidence
            );
            findings.push(finding);
        }
    }
    findings
}
