//! Classification stage: resolves each line item's declared code against the
//! reference table, falling back to fuzzy description matching and then to
//! the completion collaborator. This stage never fails a document; every
//! error path degrades to a lower-confidence result instead.

use log::{debug, warn};
use strsim::jaro_winkler;

use crate::config::ClassificationConfig;
use crate::error::{FiscalAuditError, Result};
use crate::llm::{
    classification_user_prompt, clean_json_block, ClassificationAnswer, CompletionClient,
    SYSTEM_PROMPT_CLASSIFICATION,
};
use crate::reference::ReferenceTable;
use crate::schema::{
    is_valid_classification_code, ClassificationResult, ClassificationSource, LineItem,
};

pub struct Classifier<'a> {
    config: &'a ClassificationConfig,
    table: &'a ReferenceTable,
    client: Option<&'a dyn CompletionClient>,
}

impl<'a> Classifier<'a> {
    pub fn new(
        config: &'a ClassificationConfig,
        table: &'a ReferenceTable,
        client: Option<&'a dyn CompletionClient>,
    ) -> Self {
        Classifier {
            config,
            table,
            client,
        }
    }

    pub async fn classify_document(&self, items: &[LineItem]) -> Vec<ClassificationResult> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(self.classify_item(item).await);
        }
        results
    }

    pub async fn classify_item(&self, item: &LineItem) -> ClassificationResult {
        if is_valid_classification_code(&item.declared_code)
            && self.table.get(&item.declared_code).is_some()
        {
            return ClassificationResult {
                item_number: item.number,
                resolved_code: item.declared_code.clone(),
                confidence: 1.0,
                source: ClassificationSource::ReferenceTableExact,
                rationale: "declared code found in the reference table".to_string(),
            };
        }

        let ranked = self.ranked_candidates(&item.description);

        if let Some((score, code, description)) = ranked.first() {
            if *score >= self.config.fuzzy_threshold {
                debug!(
                    "item {}: fuzzy match '{}' at {:.3}",
                    item.number, description, score
                );
                return ClassificationResult {
                    item_number: item.number,
                    resolved_code: (*code).to_string(),
                    confidence: self.fuzzy_confidence(*score),
                    source: ClassificationSource::ReferenceTableFuzzy,
                    rationale: format!(
                        "description matched reference entry '{}' at similarity {:.2}",
                        description, score
                    ),
                };
            }
        }

        if let Some(client) = self.client {
            match self.ask_model(client, item, &ranked).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(
                        "model classification failed for item {} ('{}'): {}",
                        item.number, item.description, e
                    );
                }
            }

            if let Some((score, code, description)) = ranked.first() {
                if *score >= self.config.degraded_floor {
                    return ClassificationResult {
                        item_number: item.number,
                        resolved_code: (*code).to_string(),
                        confidence: 0.30,
                        source: ClassificationSource::ReferenceTableFuzzy,
                        rationale: format!(
                            "model unavailable; nearest reference entry '{}' at similarity {:.2}",
                            description, score
                        ),
                    };
                }
            }
        }

        ClassificationResult {
            item_number: item.number,
            resolved_code: item.declared_code.clone(),
            confidence: 0.10,
            source: ClassificationSource::Unclassified,
            rationale: "no reference match and no usable model answer".to_string(),
        }
    }

    /// Reference entries ranked by case-folded Jaro-Winkler similarity to
    /// the item description, best first.
    fn ranked_candidates(&self, description: &str) -> Vec<(f64, &'a str, &'a str)> {
        let folded = description.to_lowercase();
        let mut ranked: Vec<(f64, &str, &str)> = self
            .table
            .entries()
            .map(|entry| {
                let score = jaro_winkler(&folded, &entry.description.to_lowercase());
                (score, entry.code.as_str(), entry.description.as_str())
            })
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Confidence for an accepted fuzzy match: 0.60 at the threshold scaling
    /// linearly to 0.95 at similarity 1.0.
    fn fuzzy_confidence(&self, score: f64) -> f64 {
        let threshold = self.config.fuzzy_threshold;
        if threshold >= 1.0 {
            return 0.95;
        }
        let span = (score - threshold) / (1.0 - threshold);
        (0.60 + 0.35 * span).clamp(0.60, 0.95)
    }

    async fn ask_model(
        &self,
        client: &dyn CompletionClient,
        item: &LineItem,
        ranked: &[(f64, &str, &str)],
    ) -> Result<ClassificationResult> {
        let candidates: Vec<(String, String)> = ranked
            .iter()
            .take(self.config.max_candidates)
            .map(|(_, code, description)| (code.to_string(), description.to_string()))
            .collect();
        let prompt = classification_user_prompt(&item.description, &item.declared_code, &candidates);

        let raw = client.complete(SYSTEM_PROMPT_CLASSIFICATION, &prompt).await?;
        let answer: ClassificationAnswer = serde_json::from_str(clean_json_block(&raw))?;

        let code: String = answer.code.chars().filter(|c| c.is_ascii_digit()).collect();
        if !is_valid_classification_code(&code) {
            return Err(FiscalAuditError::Completion(format!(
                "model answered with unusable code '{}'",
                answer.code
            )));
        }

        Ok(ClassificationResult {
            item_number: item.number,
            resolved_code: code,
            confidence: self.config.model_confidence,
            source: ClassificationSource::ModelInferred,
            rationale: answer.rationale,
        })
    }
}
