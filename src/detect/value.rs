//! Internal arithmetic of one document: header total vs. item sum, per-line
//! quantity x unit price vs. declared line total, and tax exceeding total.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::schema::{DetectorKind, FraudFinding};

use super::DetectionInput;

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let tolerance = input.config.value.tolerance;
    let document = input.document;
    let mut best: Option<FraudFinding> = None;

    if !document.items.is_empty() {
        let item_sum: Decimal = document.items.iter().map(|item| item.line_total).sum();
        let diff = (document.declared_total - item_sum).abs();
        if diff > tolerance {
            consider(
                &mut best,
                FraudFinding {
                    kind: DetectorKind::ValueInconsistency,
                    severity: ratio_severity(diff, document.declared_total),
                    confidence: 0.9,
                    evidence: format!(
                        "declared total {} disagrees with item sum {} by {}",
                        document.declared_total, item_sum, diff
                    ),
                    item_number: None,
                },
            );
        }
    }

    for item in &document.items {
        let computed = item.quantity * item.unit_price;
        let diff = (computed - item.line_total).abs();
        if diff <= tolerance {
            continue;
        }
        consider(
            &mut best,
            FraudFinding {
                kind: DetectorKind::ValueInconsistency,
                severity: ratio_severity(diff, item.line_total),
                confidence: 0.8,
                evidence: format!(
                    "item {}: {} x {} = {} but the declared line total is {}",
                    item.number, item.quantity, item.unit_price, computed, item.line_total
                ),
                item_number: Some(item.number),
            },
        );
    }

    if let Some(tax) = document.declared_tax {
        if tax > document.declared_total {
            consider(
                &mut best,
                FraudFinding {
                    kind: DetectorKind::ValueInconsistency,
                    severity: 60.0,
                    confidence: 0.6,
                    evidence: format!(
                        "declared tax {} exceeds the document total {}",
                        tax, document.declared_total
                    ),
                    item_number: None,
                },
            );
        }
    }

    best
}

fn ratio_severity(diff: Decimal, base: Decimal) -> f64 {
    if base <= Decimal::ZERO {
        return 100.0;
    }
    ((diff / base).to_f64().unwrap_or(1.0) * 1000.0).min(100.0)
}

/// Keeps the strongest signal: higher severity, then higher confidence.
fn consider(best: &mut Option<FraudFinding>, candidate: FraudFinding) {
    let replace = match best {
        Some(current) => {
            candidate.severity > current.severity
                || (candidate.severity == current.severity
                    && candidate.confidence > current.confidence)
        }
        None => true,
    };
    if replace {
        *best = Some(candidate);
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use crate::config::AuditConfig;
    use crate::detect::{BatchContext, DetectionInput};
    use crate::reference::{ReferenceTable, RiskRegistry};
    use crate::schema::{DocumentKind, FiscalDocument, FraudFinding, LineItem};

    fn item(number: u32, quantity: i64, unit_price: i64, line_total: i64) -> LineItem {
        LineItem {
            number,
            product_code: None,
            description: "Cabo HDMI 2m".to_string(),
            declared_code: "85444200".to_string(),
            unit: "UN".to_string(),
            quantity: Decimal::new(quantity, 0),
            unit_price: Decimal::new(unit_price, 0),
            line_total: Decimal::new(line_total, 0),
            operation_code: "5102".to_string(),
        }
    }

    fn document(total: i64, tax: Option<i64>, items: Vec<LineItem>) -> FiscalDocument {
        FiscalDocument {
            access_key: None,
            kind: DocumentKind::Invoice,
            number: None,
            series: None,
            issuer_tax_id: "11111111000111".to_string(),
            issuer_name: None,
            recipient_tax_id: None,
            recipient_name: None,
            issued_at: NaiveDate::from_ymd_opt(2024, 3, 12)
                .unwrap()
                .and_hms_opt(11, 0, 0)
                .unwrap(),
            declared_total: Decimal::new(total, 0),
            declared_tax: tax.map(|t| Decimal::new(t, 0)),
            items,
        }
    }

    fn run(doc: &FiscalDocument) -> Option<FraudFinding> {
        let context = BatchContext::build(std::iter::once(doc));
        let reference = ReferenceTable::builtin_demo();
        let registry = RiskRegistry::default();
        let config = AuditConfig::default();
        super::detect(&DetectionInput {
            document: doc,
            classifications: &[],
            context: &context,
            reference: &reference,
            registry: &registry,
            config: &config,
        })
    }

    #[test]
    fn test_header_disagrees_with_item_sum() {
        let doc = document(1_000, None, vec![item(1, 1, 950, 950)]);
        let finding = run(&doc).unwrap();
        // 50 / 1000 * 1000
        assert!((finding.severity - 50.0).abs() < 1e-9);
        assert!((finding.confidence - 0.9).abs() < 1e-9);
        assert_eq!(finding.item_number, None);
        println!("✓ header mismatch: {}", finding.evidence);
    }

    #[test]
    fn test_line_arithmetic_mismatch() {
        let doc = document(500, None, vec![item(1, 2, 240, 500)]);
        let finding = run(&doc).unwrap();
        // |480 - 500| / 500 * 1000
        assert!((finding.severity - 40.0).abs() < 1e-9);
        assert!((finding.confidence - 0.8).abs() < 1e-9);
        assert_eq!(finding.item_number, Some(1));
    }

    #[test]
    fn test_tax_exceeding_total() {
        let doc = document(100, Some(150), vec![item(1, 1, 100, 100)]);
        let finding = run(&doc).unwrap();
        assert!((finding.severity - 60.0).abs() < 1e-9);
        assert!(finding.evidence.contains("exceeds"));
    }

    #[test]
    fn test_strongest_signal_wins() {
        // Header off by 5% (severity 50) and tax above total (severity 60).
        let doc = document(1_000, Some(1_200), vec![item(1, 1, 950, 950)]);
        let finding = run(&doc).unwrap();
        assert!((finding.severity - 60.0).abs() < 1e-9);
        assert!(finding.evidence.contains("exceeds"));
    }

    #[test]
    fn test_consistent_document_is_quiet() {
        let doc = document(
            600,
            Some(50),
            vec![item(1, 2, 100, 200), item(2, 1, 400, 400)],
        );
        assert!(run(&doc).is_none());
    }

    #[test]
    fn test_rounding_noise_within_tolerance() {
        let mut doc = document(100, None, vec![item(1, 1, 100, 100)]);
        doc.declared_total = Decimal::new(100_005, 3);
        assert!(run(&doc).is_none());
    }
}
