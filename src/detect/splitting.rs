//! Document splitting: several below-threshold documents on the same pair
//! inside a short window whose combined value crosses the regulatory
//! threshold, or rapid-fire issuance bursts.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::schema::{format_tax_id, DetectorKind, FraudFinding};

use super::DetectionInput;

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let config = &input.config.splitting;
    let threshold = config.regulatory_threshold;
    if threshold <= Decimal::ZERO {
        return None;
    }
    let document = input.document;
    // Only documents that could themselves be one slice of a split.
    if document.declared_total >= threshold {
        return None;
    }

    let issued_at = document.issued_at;
    let mut best: Option<(f64, String)> = None;

    if let Some(recipient) = document.recipient_tax_id.as_deref() {
        let window = Duration::hours(config.window_hours);
        let mut count = 0usize;
        let mut combined = Decimal::ZERO;
        for (t, total) in input
            .context
            .pair_documents(&document.issuer_tax_id, recipient)
        {
            if *t < issued_at - window || *t > issued_at + window {
                continue;
            }
            if *total >= threshold {
                continue;
            }
            count += 1;
            combined += *total;
        }
        if count >= 2 && combined > threshold {
            let ratio = (combined / threshold).to_f64().unwrap_or(0.0);
            let severity = (ratio * 50.0 + count as f64 * 10.0).min(100.0);
            let evidence = format!(
                "{} documents below {} from {} to {} within {}h, combined {} exceeds the threshold",
                count,
                threshold,
                format_tax_id(&document.issuer_tax_id),
                format_tax_id(recipient),
                config.window_hours,
                combined
            );
            best = Some((severity, evidence));
        }
    }

    let burst_window = Duration::hours(config.burst_window_hours);
    let burst = input
        .context
        .issuer_timestamps(&document.issuer_tax_id)
        .iter()
        .filter(|t| **t >= issued_at - burst_window && **t <= issued_at + burst_window)
        .count();
    if burst >= config.burst_min_documents {
        let severity = (burst as f64 * 20.0 + 30.0).min(100.0);
        let stronger = match &best {
            Some((combined_severity, _)) => severity > *combined_severity,
            None => true,
        };
        if stronger {
            let evidence = format!(
                "{} issued {} documents within {}h of this one",
                format_tax_id(&document.issuer_tax_id),
                burst,
                config.burst_window_hours
            );
            best = Some((severity, evidence));
        }
    }

    let (severity, evidence) = best?;
    Some(FraudFinding {
        kind: DetectorKind::Splitting,
        severity,
        confidence: 0.8,
        evidence,
        item_number: None,
    })
}
