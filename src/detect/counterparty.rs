//! Matches the document's parties against the caller-supplied risk registry.

use crate::schema::{format_tax_id, DetectorKind, FraudFinding};

use super::DetectionInput;

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let document = input.document;
    let mut matches = Vec::new();
    if let Some(entry) = input.registry.lookup(&document.issuer_tax_id) {
        matches.push(("issuer", entry));
    }
    if let Some(recipient) = document.recipient_tax_id.as_deref() {
        if let Some(entry) = input.registry.lookup(recipient) {
            matches.push(("recipient", entry));
        }
    }
    // Tier ordering runs Low < Medium < High < Critical; the worst party
    // sets the severity.
    let worst = matches.iter().map(|(_, entry)| entry.tier).max()?;
    let evidence = matches
        .iter()
        .map(|(role, entry)| {
            format!(
                "{} {} is registered as {:?} risk: {}",
                role,
                format_tax_id(&entry.tax_id),
                entry.tier,
                entry.reason
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    Some(FraudFinding {
        kind: DetectorKind::HighRiskCounterparty,
        severity: worst.severity(),
        confidence: 0.95,
        evidence,
        item_number: None,
    })
}
