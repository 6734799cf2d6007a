use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Tuning knobs for the whole pipeline. Every threshold the detectors and
/// stages consult lives here; the defaults are the operationally tuned
/// values, not derived constants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub extraction: ExtractionConfig,
    pub classification: ClassificationConfig,
    pub underpricing: UnderpricingConfig,
    pub misclassification: MisclassificationConfig,
    pub triangulation: TriangulationConfig,
    pub splitting: SplittingConfig,
    pub temporal: TemporalConfig,
    pub value: ValueConfig,
    /// Concurrent document analyses per batch; bounds pressure on the
    /// completion collaborator.
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    /// Lifetime for in-memory cache entries; None keeps entries for the
    /// cache's lifetime.
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Relative disagreement between quantity x unit price and the declared
    /// line total above which a coercion warning is recorded.
    pub line_total_relative_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Minimum Jaro-Winkler similarity for a fuzzy description match.
    pub fuzzy_threshold: f64,
    /// Similarity floor for the degraded reference-table-only answer after
    /// model retries are exhausted. Multi-word noise scores around 0.42
    /// against any spaced description (the separators alone match), so the
    /// floor must stay above that plateau.
    pub degraded_floor: f64,
    /// Fixed confidence assigned to model-inferred results.
    pub model_confidence: f64,
    /// Candidate codes offered to the model, ranked by fuzzy similarity.
    pub max_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnderpricingConfig {
    /// Fires when unit price < min_fraction x reference band minimum.
    pub min_fraction: f64,
    /// Classification confidence below which an item is not priced against
    /// the band for its resolved code.
    pub min_classification_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MisclassificationConfig {
    /// Resolved-code confidence required before a declared/resolved
    /// disagreement counts.
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriangulationConfig {
    pub window_days: i64,
    pub ping_pong_window_days: i64,
    /// Reciprocal exchanges within the ping-pong window that count as
    /// re-invoicing.
    pub ping_pong_min_exchanges: usize,
    /// Same-pair documents within the window that count as relationship
    /// churn.
    pub relationship_min_documents: usize,
    pub high_value: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplittingConfig {
    /// Regulatory value threshold the split documents jointly exceed.
    pub regulatory_threshold: Decimal,
    pub window_hours: i64,
    pub burst_window_hours: i64,
    pub burst_min_documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemporalConfig {
    /// Business hours end; issues at or after this hour score as night-time.
    pub night_start_hour: u32,
    /// Business hours start; issues before this hour score as night-time.
    pub night_end_hour: u32,
    pub weekend_min_documents: usize,
    pub holiday_min_documents: usize,
    /// Same-issuer documents within the burst window that count as a dense
    /// sequence.
    pub burst_min_documents: usize,
    pub burst_window_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValueConfig {
    /// Absolute monetary tolerance for total/line-math disagreements.
    pub tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            line_total_relative_tolerance: 0.01,
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        ClassificationConfig {
            fuzzy_threshold: 0.85,
            degraded_floor: 0.55,
            model_confidence: 0.75,
            max_candidates: 5,
        }
    }
}

impl Default for UnderpricingConfig {
    fn default() -> Self {
        UnderpricingConfig {
            min_fraction: 0.5,
            min_classification_confidence: 0.5,
        }
    }
}

impl Default for MisclassificationConfig {
    fn default() -> Self {
        MisclassificationConfig {
            min_confidence: 0.7,
        }
    }
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        TriangulationConfig {
            window_days: 90,
            ping_pong_window_days: 30,
            ping_pong_min_exchanges: 3,
            relationship_min_documents: 5,
            high_value: Decimal::new(50_000, 0),
        }
    }
}

impl Default for SplittingConfig {
    fn default() -> Self {
        SplittingConfig {
            regulatory_threshold: Decimal::new(10_000, 0),
            window_hours: 24,
            burst_window_hours: 2,
            burst_min_documents: 3,
        }
    }
}

impl Default for TemporalConfig {
    fn default() -> Self {
        TemporalConfig {
            night_start_hour: 22,
            night_end_hour: 6,
            weekend_min_documents: 5,
            holiday_min_documents: 3,
            burst_min_documents: 10,
            burst_window_hours: 1,
        }
    }
}

impl Default for ValueConfig {
    fn default() -> Self {
        ValueConfig {
            tolerance: Decimal::new(1, 2),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 500,
            max_jitter_ms: 250,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            extraction: ExtractionConfig::default(),
            classification: ClassificationConfig::default(),
            underpricing: UnderpricingConfig::default(),
            misclassification: MisclassificationConfig::default(),
            triangulation: TriangulationConfig::default(),
            splitting: SplittingConfig::default(),
            temporal: TemporalConfig::default(),
            value: ValueConfig::default(),
            max_concurrency: 4,
            retry: RetryConfig::default(),
            cache_ttl_secs: None,
        }
    }
}
