//! # Fiscal Auditor
//!
//! A library for analyzing batches of Brazilian electronic fiscal documents
//! (NF-e invoices and NFS-e service notes) and producing a consolidated
//! fraud-risk report.
//!
//! ## Core Concepts
//!
//! - **Extraction**: XML and delimited-text inputs (character encoding and
//!   delimiter detected per file) are normalized into one canonical
//!   [`FiscalDocument`] model; recoverable fixes surface as coercion warnings
//! - **Classification**: every line item gets a standardized NCM-style code,
//!   resolved by reference-table lookup, fuzzy description match, or a
//!   language-model collaborator, each step with an explicit confidence
//! - **Detection**: seven independent detectors (underpricing,
//!   misclassification, triangulation, splitting, high-risk counterparties,
//!   temporal anomalies, value inconsistencies) emit scored findings
//! - **Aggregation**: findings roll up into a per-document risk score and
//!   level, and per-batch summary statistics, in original input order
//!
//! ## Example
//!
//! ```rust,ignore
//! use fiscal_auditor::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let orchestrator = AnalysisOrchestrator::new(
//!     AuditConfig::default(),
//!     ReferenceTable::builtin_demo(),
//!     RiskRegistry::default(),
//!     Arc::new(MemoryCache::new(None)),
//!     None, // no completion client: classification degrades to table-only
//! );
//!
//! let files = vec![InputFile::new("notas.xml", std::fs::read("notas.xml")?)];
//! let report = orchestrator.run_batch(&files, &CancellationToken::new()).await;
//!
//! for doc in &report.documents {
//!     println!("{}: {:?} ({:.2})", doc.source_id, doc.risk_level, doc.risk_score);
//! }
//! ```

pub mod cache;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod extract;
pub mod llm;
pub mod markup;
pub mod orchestrator;
pub mod reference;
pub mod schema;
pub mod tabular;

pub use cache::{fingerprint, AnalysisCache, MemoryCache, SingleFlight};
pub use classify::Classifier;
pub use config::*;
pub use detect::{run_all, BatchContext, DetectionInput};
pub use error::{FiscalAuditError, Result};
pub use llm::{CompletionClient, HttpCompletionClient};
pub use orchestrator::{aggregate_score, AnalysisOrchestrator, InputFile};
pub use reference::{PriceBand, ReferenceEntry, ReferenceTable, RiskEntry, RiskRegistry, RiskTier};
pub use schema::*;
