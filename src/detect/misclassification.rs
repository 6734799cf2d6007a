//! Declared classification codes compared against confidently resolved ones.

use crate::schema::{DetectorKind, FraudFinding};

use super::DetectionInput;

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let config = &input.config.misclassification;

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
        if classification.confidence < config.min_confidence {
            continue;
        }
        if item.declared_code.is_empty() || item.declared_code == classification.resolved_code {
            continue;
        }

        let mut severity = 40.0;
        let chapter_mismatch =
            item.declared_code.get(0..2) != classification.resolved_code.get(0..2);
        if chapter_mismatch {
            severity += 25.0;
        }
        if classification.confidence >= 0.9 {
            severity += 10.0;
        }

        let finding = FraudFinding {
            kind: DetectorKind::Misclassification,
            severity,
            confidence: classification.confidence,
            evidence: format!(
                "item {}: declared code {} but description resolves to {} ({}; confidence {:.2})",
                item.number,
                item.declared_code,
                classification.resolved_code,
                if chapter_mismatch {
                    "different chapter"
                } else {
                    "same chapter"
                },
                classification.confidence
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
