use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum DocumentKind {
    #[schemars(description = "Electronic goods invoice (NF-e style): itemized products with NCM classification codes")]
    Invoice,

    #[schemars(description = "Electronic service note (NFS-e style): a single service entry with a municipal service-list code")]
    ServiceNote,
}

/// One canonical invoice or service note. Built by the extractor and never
/// mutated afterwards; classification and detection attach derived data in
/// separate structures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiscalDocument {
    /// 44-digit access key. Absent for tabular-sourced records.
    pub access_key: Option<String>,
    pub kind: DocumentKind,
    pub number: Option<String>,
    pub series: Option<String>,
    /// Issuer tax ID, normalized to the 14-digit CNPJ space.
    pub issuer_tax_id: String,
    pub issuer_name: Option<String>,
    /// Recipient tax ID; service notes may omit the taker entirely.
    pub recipient_tax_id: Option<String>,
    pub recipient_name: Option<String>,
    pub issued_at: NaiveDateTime,
    pub declared_total: Decimal,
    pub declared_tax: Option<Decimal>,
    pub items: Vec<LineItem>,
}

impl FiscalDocument {
    /// Sum of declared line totals, for the header-total invariant check.
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(|item| item.line_total).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    /// 1-based position within the document.
    pub number: u32,
    pub product_code: Option<String>,
    pub description: String,
    /// Declared classification code as found in the source, possibly malformed.
    pub declared_code: String,
    pub unit: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    /// 4-digit CFOP tax-operation code ("0000" for service notes).
    pub operation_code: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationSource {
    #[schemars(description = "Declared code found verbatim in the reference table; fully deterministic")]
    ReferenceTableExact,

    #[schemars(description = "Resolved by fuzzy description match against reference-table entries; deterministic")]
    ReferenceTableFuzzy,

    #[schemars(description = "Resolved by the language-model collaborator; not reproducible between runs")]
    ModelInferred,

    #[schemars(description = "No reference match and no usable model answer; the declared code is carried as-is")]
    Unclassified,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ClassificationResult {
    pub item_number: u32,
    pub resolved_code: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub source: ClassificationSource,
    pub rationale: String,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum DetectorKind {
    #[schemars(description = "Unit price below a configured fraction of the reference band minimum")]
    Underpricing,

    #[schemars(description = "Declared classification disagrees with a confidently resolved code")]
    Misclassification,

    #[schemars(description = "Cyclical or pass-through invoicing between the same parties")]
    Triangulation,

    #[schemars(description = "Multiple sub-threshold documents that jointly exceed a regulatory threshold")]
    Splitting,

    #[schemars(description = "Issuer or recipient listed in the supplied risk registry")]
    HighRiskCounterparty,

    #[schemars(description = "Implausible issue times or suspiciously dense issuing sequences")]
    TemporalAnomaly,

    #[schemars(description = "Declared totals disagreeing with line math or implied tax")]
    ValueInconsistency,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 7] = [
        DetectorKind::Underpricing,
        DetectorKind::Misclassification,
        DetectorKind::Triangulation,
        DetectorKind::Splitting,
        DetectorKind::HighRiskCounterparty,
        DetectorKind::TemporalAnomaly,
        DetectorKind::ValueInconsistency,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FraudFinding {
    pub kind: DetectorKind,
    /// Severity in [0, 100].
    pub severity: f64,
    /// Detector confidence in [0, 1]; weights the document-level aggregation.
    pub confidence: f64,
    pub evidence: String,
    /// 1-based line-item number for item-level findings; None for
    /// document-level findings.
    pub item_number: Option<u32>,
}

/// A recoverable normalization applied during extraction. Both values are
/// kept so downstream detectors see the original data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct CoercionWarning {
    pub field: String,
    pub original: String,
    pub coerced: String,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum RiskLevel {
    #[schemars(description = "Overall risk score in [0, 30]")]
    Low,

    #[schemars(description = "Overall risk score in (30, 60]")]
    Medium,

    #[schemars(description = "Overall risk score in (60, 85]")]
    High,

    #[schemars(description = "Overall risk score in (85, 100]")]
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 30.0 {
            RiskLevel::Low
        } else if score <= 60.0 {
            RiskLevel::Medium
        } else if score <= 85.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "status")]
pub enum AnalysisStatus {
    Complete,
    Failed { reason: String },
}

impl AnalysisStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, AnalysisStatus::Complete)
    }
}

/// Everything the pipeline produced for one document. This is also the cache
/// value, so it round-trips through serde_json unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentAnalysis {
    /// Input file name plus record position, e.g. "notes.xml#3".
    pub source_id: String,
    pub document: Option<FiscalDocument>,
    pub fingerprint: Option<String>,
    pub classifications: Vec<ClassificationResult>,
    pub findings: Vec<FraudFinding>,
    pub warnings: Vec<CoercionWarning>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub status: AnalysisStatus,
    pub elapsed_ms: u64,
}

impl DocumentAnalysis {
    pub fn failed(source_id: String, reason: String) -> Self {
        DocumentAnalysis {
            source_id,
            document: None,
            fingerprint: None,
            classifications: Vec::new(),
            findings: Vec::new(),
            warnings: Vec::new(),
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            status: AnalysisStatus::Failed { reason },
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub total_documents: usize,
    pub complete: usize,
    pub failed: usize,
    /// Sum of declared totals over Complete documents only.
    pub total_declared_value: Decimal,
    pub findings_by_kind: BTreeMap<DetectorKind, usize>,
    pub documents_by_level: BTreeMap<RiskLevel, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    /// Per-document results in original input order (file order, then record
    /// order within each file).
    pub documents: Vec<DocumentAnalysis>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn complete_documents(&self) -> impl Iterator<Item = &DocumentAnalysis> {
        self.documents.iter().filter(|d| d.status.is_complete())
    }
}

pub fn is_valid_access_key(key: &str) -> bool {
    key.len() == 44 && key.chars().all(|c| c.is_ascii_digit())
}

pub fn is_valid_tax_id(id: &str) -> bool {
    id.len() == 14 && id.chars().all(|c| c.is_ascii_digit())
}

pub fn is_valid_classification_code(code: &str) -> bool {
    code.len() == 8 && code.chars().all(|c| c.is_ascii_digit())
}

pub fn is_valid_operation_code(code: &str) -> bool {
    code.len() == 4 && code.chars().all(|c| c.is_ascii_digit())
}

/// "12345678000195" -> "12.345.678/0001-95"; malformed IDs come back as-is.
pub fn format_tax_id(id: &str) -> String {
    if !is_valid_tax_id(id) {
        return id.to_string();
    }
    format!(
        "{}.{}.{}/{}-{}",
        &id[0..2],
        &id[2..5],
        &id[5..8],
        &id[8..12],
        &id[12..14]
    )
}

/// "85171231" -> "8517.12.31"; malformed codes come back as-is.
pub fn format_classification_code(code: &str) -> String {
    if !is_valid_classification_code(code) {
        return code.to_string();
    }
    format!("{}.{}.{}", &code[0..4], &code[4..6], &code[6..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_document() -> FiscalDocument {
        FiscalDocument {
            access_key: Some("12345678901234567890123456789012345678901234".to_string()),
            kind: DocumentKind::Invoice,
            number: Some("101".to_string()),
            series: Some("1".to_string()),
            issuer_tax_id: "12345678000195".to_string(),
            issuer_name: Some("Fornecedora Alfa Ltda".to_string()),
            recipient_tax_id: Some("98765432000110".to_string()),
            recipient_name: None,
            issued_at: NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
            declared_total: Decimal::new(250000, 2),
            declared_tax: Some(Decimal::new(45000, 2)),
            items: vec![LineItem {
                number: 1,
                product_code: Some("SKU-1".to_string()),
                description: "Smartphone 128GB".to_string(),
                declared_code: "85171231".to_string(),
                unit: "UN".to_string(),
                quantity: Decimal::new(1, 0),
                unit_price: Decimal::new(250000, 2),
                line_total: Decimal::new(250000, 2),
                operation_code: "5102".to_string(),
            }],
        }
    }

    #[test]
    fn test_document_serialization_round_trip() {
        let doc = sample_document();
        let json = serde_json::to_string_pretty(&doc).unwrap();
        assert!(json.contains("85171231"));

        let back: FiscalDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_items_total() {
        let doc = sample_document();
        assert_eq!(doc.items_total(), Decimal::new(250000, 2));
    }

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30.01), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(85.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(86.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Critical);
    }

    #[test]
    fn test_classification_source_wire_names() {
        let json = serde_json::to_string(&ClassificationSource::ReferenceTableExact).unwrap();
        assert_eq!(json, "\"reference-table-exact\"");
        let json = serde_json::to_string(&ClassificationSource::ModelInferred).unwrap();
        assert_eq!(json, "\"model-inferred\"");
    }

    #[test]
    fn test_validation_helpers() {
        assert!(is_valid_access_key(
            "12345678901234567890123456789012345678901234"
        ));
        assert!(!is_valid_access_key("123"));
        assert!(is_valid_tax_id("12345678000195"));
        assert!(!is_valid_tax_id("12345678901"));
        assert!(is_valid_classification_code("85171231"));
        assert!(!is_valid_classification_code("8517"));
        assert!(is_valid_operation_code("5102"));
        assert!(!is_valid_operation_code("51"));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(format_tax_id("12345678000195"), "12.345.678/0001-95");
        assert_eq!(format_tax_id("not-an-id"), "not-an-id");
        assert_eq!(format_classification_code("85171231"), "8517.12.31");
        assert_eq!(format_classification_code("123"), "123");
    }

    #[test]
    fn test_analysis_serialization_round_trip() {
        let analysis = DocumentAnalysis {
            source_id: "notes.xml#1".to_string(),
            document: Some(sample_document()),
            fingerprint: Some("ab".repeat(32)),
            classifications: vec![ClassificationResult {
                item_number: 1,
                resolved_code: "85171231".to_string(),
                confidence: 1.0,
                source: ClassificationSource::ReferenceTableExact,
                rationale: "declared code present in reference table".to_string(),
            }],
            findings: vec![FraudFinding {
                kind: DetectorKind::Underpricing,
                severity: 44.0,
                confidence: 0.8,
                evidence: "unit price 800.00 below 50% of band minimum 2000.00".to_string(),
                item_number: Some(1),
            }],
            warnings: Vec::new(),
            risk_score: 44.0,
            risk_level: RiskLevel::Medium,
            status: AnalysisStatus::Complete,
            elapsed_ms: 12,
        };

        let json = serde_json::to_string(&analysis).unwrap();
        let back: DocumentAnalysis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, analysis);
    }
}
