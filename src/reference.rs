//! Read-only reference data: the classification table with market price
//! bands, and the counterparty risk registry. Both are loaded once per batch
//! run and never written by the pipeline.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBand {
    pub min: Decimal,
    pub mean: Decimal,
    pub max: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferenceEntry {
    /// 8-digit classification code.
    pub code: String,
    pub description: String,
    /// Market unit-price band; None for codes without pricing data.
    pub price_band: Option<PriceBand>,
}

/// Classification code -> description + price band.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: BTreeMap<String, ReferenceEntry>,
}

impl ReferenceTable {
    pub fn new(entries: Vec<ReferenceEntry>) -> Self {
        ReferenceTable {
            entries: entries
                .into_iter()
                .map(|entry| (entry.code.clone(), entry))
                .collect(),
        }
    }

    /// Loads a JSON array of entries.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: Vec<ReferenceEntry> = serde_json::from_str(json)?;
        Ok(Self::new(entries))
    }

    /// Small built-in table so the pipeline runs without external data files.
    pub fn builtin_demo() -> Self {
        fn entry(code: &str, description: &str, min: i64, mean: i64, max: i64) -> ReferenceEntry {
            ReferenceEntry {
                code: code.to_string(),
                description: description.to_string(),
                price_band: Some(PriceBand {
                    min: Decimal::new(min, 0),
                    mean: Decimal::new(mean, 0),
                    max: Decimal::new(max, 0),
                }),
            }
        }

        Self::new(vec![
            entry("85171231", "Smartphones with touchscreen display", 1200, 2000, 4000),
            entry("84713012", "Portable notebook computers", 2000, 3500, 8000),
            entry("85176255", "Network routers and switching equipment", 80, 150, 400),
            entry("85044090", "Battery chargers and power adapters", 20, 50, 150),
            entry("39202090", "Plastic sheets and plates", 10, 25, 80),
            ReferenceEntry {
                code: "01070000".to_string(),
                description: "Information technology support services".to_string(),
                price_band: None,
            },
            ReferenceEntry {
                code: "14010000".to_string(),
                description: "Machine and equipment repair services".to_string(),
                price_band: None,
            },
        ])
    }

    pub fn get(&self, code: &str) -> Option<&ReferenceEntry> {
        self.entries.get(code)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReferenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    /// Finding severity for a registry match of this tier.
    pub fn severity(&self) -> f64 {
        match self {
            RiskTier::Low => 20.0,
            RiskTier::Medium => 45.0,
            RiskTier::High => 70.0,
            RiskTier::Critical => 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskEntry {
    /// 14-digit tax ID.
    pub tax_id: String,
    pub tier: RiskTier,
    pub reason: String,
}

/// Tax ID -> risk tier, supplied by the caller as external reference data.
#[derive(Debug, Clone, Default)]
pub struct RiskRegistry {
    entries: BTreeMap<String, RiskEntry>,
}

impl RiskRegistry {
    pub fn new(entries: Vec<RiskEntry>) -> Self {
        RiskRegistry {
            entries: entries
                .into_iter()
                .map(|entry| (entry.tax_id.clone(), entry))
                .collect(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: Vec<RiskEntry> = serde_json::from_str(json)?;
        Ok(Self::new(entries))
    }

    pub fn lookup(&self, tax_id: &str) -> Option<&RiskEntry> {
        self.entries.get(tax_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_demo_lookup() {
        let table = ReferenceTable::builtin_demo();
        let entry = table.get("85171231").unwrap();
        assert_eq!(entry.price_band.as_ref().unwrap().min, Decimal::new(1200, 0));
        assert!(table.get("00000000").is_none());
    }

    #[test]
    fn test_table_from_json() {
        let json = r#"[
            {"code": "11111111", "description": "Test product",
             "price_band": {"min": "10", "mean": "20", "max": "40"}},
            {"code": "22222222", "description": "Unpriced product", "price_band": null}
        ]"#;
        let table = ReferenceTable::from_json_str(json).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("11111111").unwrap().price_band.as_ref().unwrap().mean,
            Decimal::new(20, 0)
        );
        assert!(table.get("22222222").unwrap().price_band.is_none());
    }

    #[test]
    fn test_registry_lookup_and_severity() {
        let registry = RiskRegistry::new(vec![RiskEntry {
            tax_id: "12345678000195".to_string(),
            tier: RiskTier::High,
            reason: "suspended registration".to_string(),
        }]);
        let entry = registry.lookup("12345678000195").unwrap();
        assert_eq!(entry.tier.severity(), 70.0);
        assert!(registry.lookup("99999999000199").is_none());
    }
}
