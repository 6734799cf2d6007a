//! Cyclical and pass-through invoicing between the batch's parties: A→B→A
//! returns, three-party cycles, and ping-pong re-invoicing.

use chrono::{Duration, NaiveDateTime};

use crate::schema::{format_tax_id, DetectorKind, FraudFinding};

use super::DetectionInput;

const FIRE_THRESHOLD: f64 = 40.0;

pub(super) fn detect(input: &DetectionInput<'_>) -> Option<FraudFinding> {
    let config = &input.config.triangulation;
    let document = input.document;
    let issuer = document.issuer_tax_id.as_str();
    let recipient = document.recipient_tax_id.as_deref()?;
    if issuer == recipient {
        return None;
    }

    let issued_at = document.issued_at;
    let window = Duration::days(config.window_days);
    let in_window =
        |t: &NaiveDateTime| *t >= issued_at - window && *t <= issued_at + window;

    let mut severity: f64 = 0.0;
    let mut evidence = Vec::new();

    let reciprocal = input
        .context
        .pair_documents(recipient, issuer)
        .iter()
        .any(|(t, _)| in_window(t));
    if reciprocal {
        severity += 40.0;
        evidence.push(format!(
            "reciprocal invoicing {} -> {} -> {} within {} days",
            format_tax_id(issuer),
            format_tax_id(recipient),
            format_tax_id(issuer),
            config.window_days
        ));
    } else if let Some(middle) = find_cycle_middle(input, issuer, recipient, &in_window) {
        severity += 40.0;
        evidence.push(format!(
            "three-party cycle {} -> {} -> {} -> {} within {} days",
            format_tax_id(issuer),
            format_tax_id(recipient),
            format_tax_id(&middle),
            format_tax_id(issuer),
            config.window_days
        ));
    }

    let ping_window = Duration::days(config.ping_pong_window_days);
    let in_ping_window =
        |t: &NaiveDateTime| *t >= issued_at - ping_window && *t <= issued_at + ping_window;
    let outbound = input
        .context
        .pair_documents(issuer, recipient)
        .iter()
        .filter(|(t, _)| in_ping_window(t))
        .count();
    let inbound = input
        .context
        .pair_documents(recipient, issuer)
        .iter()
        .filter(|(t, _)| in_ping_window(t))
        .count();
    let exchanges = outbound.min(inbound);
    if exchanges >= config.ping_pong_min_exchanges {
        severity += 30.0;
        evidence.push(format!(
            "{} reciprocal exchanges within {} days (ping-pong re-invoicing)",
            exchanges, config.ping_pong_window_days
        ));
    }

    let same_pair = input
        .context
        .pair_documents(issuer, recipient)
        .iter()
        .filter(|(t, _)| in_window(t))
        .count();
    if same_pair >= config.relationship_min_documents {
        severity += 25.0;
        evidence.push(format!(
            "{} documents on the same pair within {} days",
            same_pair, config.window_days
        ));
    }

    if document.declared_total > config.high_value {
        severity += 10.0;
        evidence.push(format!(
            "high transaction value {}",
            document.declared_total
        ));
    }

    severity = severity.min(100.0);
    if severity < FIRE_THRESHOLD {
        return None;
    }
    Some(FraudFinding {
        kind: DetectorKind::Triangulation,
        severity,
        confidence: 0.75,
        evidence: evidence.join("; "),
        item_number: None,
    })
}

/// Looks for a third party C with recipient->C and C->issuer documents
/// inside the window.
fn find_cycle_middle(
    input: &DetectionInput<'_>,
    issuer: &str,
    recipient: &str,
    in_window: &dyn Fn(&NaiveDateTime) -> bool,
) -> Option<String> {
    for middle in input.context.recipients_of(recipient) {
        if middle == issuer || middle == recipient {
            continue;
        }
        let forward = input
            .context
            .pair_documents(recipient, middle)
            .iter()
            .any(|(t, _)| in_window(t));
        let back = input
            .context
            .pair_documents(middle, issuer)
            .iter()
            .any(|(t, _)| in_window(t));
        if forward && back {
            return Some(middle.to_string());
        }
    }
    None
}
