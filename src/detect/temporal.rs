//! Issue-time anomalies: night-time issuance, weekend and holiday patterns,
//! and rapid issuance bursts by the same issuer.

use chrono::{Datelike, Duration, NaiveDateTime, Timelike, Weekday};

use crate::schema::{DetectorKind, FraudFinding};

use super::DetectionInput;

const FIRE_THRESHOLD: f64 = 30.0;

/// Fixed-date Brazilian national holidays as (month, day). Movable feasts
/// (Carnival, Good Friday, Corpus Christi) are not modelled.
const FIXED_HOLIDAYS: [(u32, u32); 8] = [
    (1, 1),
    (4, 21),
    (5, 1),
    (9, 7),
    (10, 12),
    (11, 2),
    (11, 15),
    (12, 25),
];

fn is_weekend(t: &NaiveDateTime) -> bool {
    matches!(t.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_fixed_holiday(t: &NaiveDateTime) -> bool {
    FIXED_HOLIDAYS.contains(&(t.month(), t.day()))
}

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let config = &input.config.temporal;
    let document = input.document;
    let issued_at = document.issued_at;
    let hour = issued_at.hour();

    let mut severity = 0.0;
    let mut evidence = Vec::new();

    if hour >= config.night_start_hour || hour < config.night_end_hour {
        let points = if hour < 5 { 50.0 } else { 30.0 };
        severity += points;
        evidence.push(format!(
            "issued at {} outside business hours",
            issued_at.format("%H:%M")
        ));
    }

    let timeline = input.context.issuer_timestamps(&document.issuer_tax_id);

    if is_weekend(&issued_at) {
        let weekend_count = timeline.iter().filter(|t| is_weekend(t)).count();
        if weekend_count >= config.weekend_min_documents {
            severity += (weekend_count as f64 * 15.0).min(100.0);
            evidence.push(format!(
                "issuer has {} weekend documents in the batch",
                weekend_count
            ));
        }
    }

    if is_fixed_holiday(&issued_at) {
        let holiday_count = timeline.iter().filter(|t| is_fixed_holiday(t)).count();
        if holiday_count >= config.holiday_min_documents {
            severity += (holiday_count as f64 * 20.0).min(100.0);
            evidence.push(format!(
                "issued on a national holiday; issuer has {} holiday documents in the batch",
                holiday_count
            ));
        }
    }

    let burst_window = Duration::hours(config.burst_window_hours);
    let burst = timeline
        .iter()
        .filter(|t| **t >= issued_at - burst_window && **t <= issued_at + burst_window)
        .count();
    if burst >= config.burst_min_documents {
        severity += 25.0;
        evidence.push(format!(
            "issuer produced {} documents within {}h of this one",
            burst, config.burst_window_hours
        ));
    }

    severity = severity.min(100.0);
    if severity < FIRE_THRESHOLD {
        return None;
    }
    Some(FraudFinding {
        kind: DetectorKind::TemporalAnomaly,
        severity,
        confidence: 0.70,
        evidence: evidence.join("; "),
        item_number: None,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use crate::config::AuditConfig;
    use crate::detect::{BatchContext, DetectionInput};
    use crate::reference::{ReferenceTable, RiskRegistry};
    use crate::schema::{DocumentKind, FiscalDocument, FraudFinding};

    fn document(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> FiscalDocument {
        FiscalDocument {
            access_key: None,
            kind: DocumentKind::Invoice,
            number: None,
            series: None,
            issuer_tax_id: "11111111000111".to_string(),
            issuer_name: None,
            recipient_tax_id: Some("22222222000122".to_string()),
            recipient_name: None,
            issued_at: NaiveDate::from_ymd_opt(year, month, day)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap(),
            declared_total: Decimal::new(1_000, 0),
            declared_tax: None,
            items: Vec::new(),
        }
    }

    fn run(batch: &[FiscalDocument]) -> Option<FraudFinding> {
        let context = BatchContext::build(batch);
        let reference = ReferenceTable::builtin_demo();
        let registry = RiskRegistry::default();
        let config = AuditConfig::default();
        super::detect(&DetectionInput {
            document: &batch[0],
            classifications: &[],
            context: &context,
            reference: &reference,
            registry: &registry,
            config: &config,
        })
    }

    #[test]
    fn test_core_night_hours() {
        // Tuesday, 03:00.
        let batch = vec![document(2024, 3, 12, 3, 0)];
        let finding = run(&batch).unwrap();
        assert!((finding.severity - 50.0).abs() < 1e-9);
        assert!(finding.evidence.contains("03:00"));
        println!("✓ core night issuance scored {}", finding.severity);
    }

    #[test]
    fn test_late_evening() {
        let batch = vec![document(2024, 3, 12, 22, 30)];
        let finding = run(&batch).unwrap();
        assert!((finding.severity - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_business_hours_are_quiet() {
        let batch = vec![document(2024, 3, 12, 14, 0)];
        assert!(run(&batch).is_none());
    }

    #[test]
    fn test_weekend_pattern() {
        // Five weekend documents from one issuer; the current one is the
        // Saturday 2024-03-02 issue.
        let batch = vec![
            document(2024, 3, 2, 10, 0),
            document(2024, 3, 3, 10, 0),
            document(2024, 3, 9, 10, 0),
            document(2024, 3, 10, 10, 0),
            document(2024, 3, 16, 10, 0),
        ];
        let finding = run(&batch).unwrap();
        assert!((finding.severity - 75.0).abs() < 1e-9);
        assert!(finding.evidence.contains("5 weekend documents"));
    }

    #[test]
    fn test_weekday_document_ignores_weekend_history() {
        // Same weekend history, but the document under analysis is issued
        // on a Tuesday in business hours.
        let batch = vec![
            document(2024, 3, 12, 14, 0),
            document(2024, 3, 2, 10, 0),
            document(2024, 3, 3, 10, 0),
            document(2024, 3, 9, 10, 0),
            document(2024, 3, 10, 10, 0),
            document(2024, 3, 16, 10, 0),
        ];
        assert!(run(&batch).is_none());
    }

    #[test]
    fn test_holiday_pattern() {
        // New Year, Labour Day and Christmas 2024 all fall on weekdays.
        let batch = vec![
            document(2024, 1, 1, 10, 0),
            document(2024, 5, 1, 10, 0),
            document(2024, 12, 25, 10, 0),
        ];
        let finding = run(&batch).unwrap();
        assert!((finding.severity - 60.0).abs() < 1e-9);
        assert!(finding.evidence.contains("national holiday"));
    }
}
