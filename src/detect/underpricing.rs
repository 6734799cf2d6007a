//! Unit prices checked against the reference market band for each item's
//! resolved classification code.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::schema::{format_classification_code, DetectorKind, FraudFinding};

use super::DetectionInput;

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let config = &input.config.underpricing;
    let fraction = Decimal::from_f64(config.min_fraction)?;

    let mut worst: Option<FraudFinding> = None;
    for item in &input.document.items {
        let classification = match input
            .classifications
            .iter()
            .find(|c| c.item_number == item.number)
        {
            Some(c) => c,
            None => continue,
        };
        if classification.confidence < config.min_classification_confidence {
            continue;
        }
        let band = match input
            .reference
            .get(&classification.resolved_code)
            .and_then(|entry| entry.price_band.as_ref())
        {
            Some(band) => band,
            None => continue,
        };

        let threshold = band.min * fraction;
        if threshold <= Decimal::ZERO || item.unit_price >= threshold {
            continue;
        }

        let deficit = ((threshold - item.unit_price) / threshold)
            .to_f64()
            .unwrap_or(0.0);
        let severity = (30.0 + 70.0 * deficit).min(100.0);
        let confidence = (0.85 * classification.confidence).clamp(0.30, 0.95);
        let finding = FraudFinding {
            kind: DetectorKind::Underpricing,
            severity,
            confidence,
            evidence: format!(
                "item {}: unit price {} is below {}% of the reference minimum {} for code {}",
                item.number,
                item.unit_price,
                (config.min_fraction * 100.0).round() as i64,
                band.min,
                format_classification_code(&classification.resolved_code)
            ),
            item_number: Some(item.number),
        };

        let keep = match &worst {
            Some(existing) => finding.severity > existing.severity,
            None => true,
        };
        if keep {
            worst = Some(finding);
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use crate::config::AuditConfig;
    use crate::detect::{BatchContext, DetectionInput};
    use crate::reference::{ReferenceTable, RiskRegistry};
    use crate::schema::{
        ClassificationResult, ClassificationSource, DocumentKind, FiscalDocument, LineItem,
    };

    fn priced_document(unit_price: i64) -> FiscalDocument {
        FiscalDocument {
            access_key: None,
            kind: DocumentKind::Invoice,
            number: None,
            series: None,
            issuer_tax_id: "11222333000181".to_string(),
            issuer_name: None,
            recipient_tax_id: Some("98765432000110".to_string()),
            recipient_name: None,
            issued_at: NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(11, 0, 0)
                .unwrap(),
            declared_total: Decimal::new(unit_price, 0),
            declared_tax: None,
            items: vec![LineItem {
                number: 1,
                product_code: None,
                description: "Smartphone".to_string(),
                declared_code: "85171231".to_string(),
                unit: "UN".to_string(),
                quantity: Decimal::ONE,
                unit_price: Decimal::new(unit_price, 0),
                line_total: Decimal::new(unit_price, 0),
                operation_code: "5102".to_string(),
            }],
        }
    }

    fn classification(confidence: f64) -> Vec<ClassificationResult> {
        vec![ClassificationResult {
            item_number: 1,
            resolved_code: "85171231".to_string(),
            confidence,
            source: ClassificationSource::ReferenceTableExact,
            rationale: "exact".to_string(),
        }]
    }

    fn run(document: &FiscalDocument, classifications: &[ClassificationResult]) -> Option<f64> {
        let context = BatchContext::build(std::iter::once(document));
        let reference = ReferenceTable::builtin_demo();
        let registry = RiskRegistry::default();
        let config = AuditConfig::default();
        super::detect(&DetectionInput {
            document,
            classifications,
            context: &context,
            reference: &reference,
            registry: &registry,
            config: &config,
        })
        .map(|finding| finding.severity)
    }

    #[test]
    fn test_deep_underpricing_fires() {
        // smartphone band minimum is 1200, so the trigger price is 600
        let document = priced_document(480);
        let severity = run(&document, &classification(1.0)).unwrap();
        assert!((severity - 44.0).abs() < 1e-9);
        println!("✓ 40% of the band minimum fired at severity {}", severity);
    }

    #[test]
    fn test_price_near_band_minimum_does_not_fire() {
        let document = priced_document(1140);
        assert!(run(&document, &classification(1.0)).is_none());
        println!("✓ 95% of the band minimum is ordinary price dispersion");
    }

    #[test]
    fn test_low_confidence_classification_is_skipped() {
        let document = priced_document(480);
        assert!(run(&document, &classification(0.2)).is_none());
    }

    #[test]
    fn test_unpriced_code_is_skipped() {
        let mut document = priced_document(10);
        document.items[0].declared_code = "01070000".to_string();
        let classifications = vec![ClassificationResult {
            item_number: 1,
            resolved_code: "01070000".to_string(),
            confidence: 1.0,
            source: ClassificationSource::ReferenceTableExact,
            rationale: "exact".to_string(),
        }];
        assert!(run(&document, &classifications).is_none());
    }
}
