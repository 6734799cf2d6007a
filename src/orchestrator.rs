//! Analysis orchestrator: drives every document through extraction,
//! classification, detection and scoring, runs documents concurrently under
//! a bounded pool, applies fingerprint caching, and assembles the batch
//! report in original input order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::cache::{fingerprint, AnalysisCache, SingleFlight};
use crate::classify::Classifier;
use crate::config::AuditConfig;
use crate::detect::{self, BatchContext, DetectionInput};
use crate::llm::CompletionClient;
use crate::reference::{ReferenceTable, RiskRegistry};
use crate::schema::{
    AnalysisStatus, BatchReport, BatchSummary, CoercionWarning, DocumentAnalysis, FiscalDocument,
    FraudFinding, RiskLevel,
};
use crate::{extract, markup, tabular};

/// One raw input file: display name plus undecoded bytes. The orchestrator
/// never touches the filesystem itself.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        InputFile {
            name: name.into(),
            bytes,
        }
    }
}

enum PendingDocument {
    Ready {
        source_id: String,
        document: FiscalDocument,
        warnings: Vec<CoercionWarning>,
    },
    Failed {
        source_id: String,
        reason: String,
    },
}

/// Owns the pipeline collaborators for one deployment: configuration,
/// reference data, the analysis cache and (optionally) the completion
/// client. One instance serves many batches.
pub struct AnalysisOrchestrator {
    config: AuditConfig,
    reference: ReferenceTable,
    registry: RiskRegistry,
    cache: Arc<dyn AnalysisCache>,
    client: Option<Arc<dyn CompletionClient>>,
    flight: SingleFlight,
}

impl AnalysisOrchestrator {
    pub fn new(
        config: AuditConfig,
        reference: ReferenceTable,
        registry: RiskRegistry,
        cache: Arc<dyn AnalysisCache>,
        client: Option<Arc<dyn CompletionClient>>,
    ) -> Self {
        AnalysisOrchestrator {
            config,
            reference,
            registry,
            cache,
            client,
            flight: SingleFlight::new(),
        }
    }

    /// Runs one batch to completion. File-level and per-record failures
    /// become Failed entries in the report; the call itself never fails.
    /// Cancelling the token stops dispatching new documents, lets in-flight
    /// ones finish, and reports the rest as Failed.
    pub async fn run_batch(&self, files: &[InputFile], cancel: &CancellationToken) -> BatchReport {
        info!("starting batch of {} input files", files.len());

        let mut pending = Vec::new();
        for file in files {
            self.ingest_file(file, &mut pending);
        }
        let ready = pending
            .iter()
            .filter(|entry| matches!(entry, PendingDocument::Ready { .. }))
            .count();
        info!(
            "extracted {} of {} records across {} files",
            ready,
            pending.len(),
            files.len()
        );

        let context = BatchContext::build(pending.iter().filter_map(|entry| match entry {
            PendingDocument::Ready { document, .. } => Some(document),
            PendingDocument::Failed { .. } => None,
        }));

        let mut results: Vec<(usize, DocumentAnalysis)> =
            stream::iter(pending.into_iter().enumerate())
                .map(|(index, entry)| {
                    let context = &context;
                    async move {
                        let analysis = match entry {
                            PendingDocument::Failed { source_id, reason } => {
                                DocumentAnalysis::failed(source_id, reason)
                            }
                            PendingDocument::Ready {
                                source_id,
                                document,
                                warnings,
                            } => {
                                if cancel.is_cancelled() {
                                    DocumentAnalysis::failed(
                                        source_id,
                                        "batch cancelled before analysis".to_string(),
                                    )
                                } else {
                                    self.analyze_document(source_id, document, warnings, context)
                                        .await
                                }
                            }
                        };
                        (index, analysis)
                    }
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        let documents: Vec<DocumentAnalysis> =
            results.into_iter().map(|(_, analysis)| analysis).collect();
        let summary = summarize(&documents);
        info!(
            "batch finished: {} complete, {} failed",
            summary.complete, summary.failed
        );
        BatchReport { documents, summary }
    }

    fn ingest_file(&self, file: &InputFile, pending: &mut Vec<PendingDocument>) {
        if looks_like_markup(file) {
            match markup::read_records(&file.name, &file.bytes) {
                Ok((kind, records)) => {
                    debug!("{}: {} {:?} records", file.name, records.len(), kind);
                    for (i, record) in records.iter().enumerate() {
                        let source_id = format!("{}#{}", file.name, i + 1);
                        match extract::from_markup(&self.config.extraction, &source_id, kind, record)
                        {
                            Ok((document, warnings)) => pending.push(PendingDocument::Ready {
                                source_id,
                                document,
                                warnings,
                            }),
                            Err(e) => {
                                warn!("{}: extraction failed: {}", source_id, e);
                                pending.push(PendingDocument::Failed {
                                    source_id,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: unreadable: {}", file.name, e);
                    pending.push(PendingDocument::Failed {
                        source_id: file.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            match tabular::read_table(&file.name, &file.bytes) {
                Ok(table) => {
                    debug!(
                        "{}: {} rows decoded as {} with delimiter {:?}",
                        file.name,
                        table.rows.len(),
                        table.encoding,
                        table.delimiter
                    );
                    for (i, row) in table.rows.iter().enumerate() {
                        let source_id = format!("{}#{}", file.name, i + 1);
                        match extract::from_row(&self.config.extraction, &source_id, row) {
                            Ok((document, warnings)) => pending.push(PendingDocument::Ready {
                                source_id,
                                document,
                                warnings,
                            }),
                            Err(e) => {
                                warn!("{}: extraction failed: {}", source_id, e);
                                pending.push(PendingDocument::Failed {
                                    source_id,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: unreadable: {}", file.name, e);
                    pending.push(PendingDocument::Failed {
                        source_id: file.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn analyze_document(
        &self,
        source_id: String,
        document: FiscalDocument,
        warnings: Vec<CoercionWarning>,
        context: &BatchContext,
    ) -> DocumentAnalysis {
        let started = Instant::now();
        let fp = match fingerprint(&document) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("{}: fingerprint failed, analyzing uncached: {}", source_id, e);
                return self
                    .compute_analysis(source_id, document, warnings, context, None, started)
                    .await;
            }
        };

        // Per-fingerprint lock held across read, compute and write, so
        // concurrent duplicates cost exactly one computation.
        let lock = self.flight.lock_for(&fp).await;
        let analysis = {
            let _guard = lock.lock().await;
            if let Some(mut cached) = self.cached_analysis(&fp, &source_id).await {
                cached.source_id = source_id;
                cached.elapsed_ms = started.elapsed().as_millis() as u64;
                cached
            } else {
                let analysis = self
                    .compute_analysis(
                        source_id,
                        document,
                        warnings,
                        context,
                        Some(fp.clone()),
                        started,
                    )
                    .await;
                match serde_json::to_string(&analysis) {
                    Ok(json) => {
                        if let Err(e) = self.cache.put(&fp, json).await {
                            warn!("{}: cache write failed: {}", analysis.source_id, e);
                        }
                    }
                    Err(e) => warn!("{}: cache serialization failed: {}", analysis.source_id, e),
                }
                analysis
            }
        };
        drop(lock);
        self.flight.release(&fp).await;
        analysis
    }

    async fn cached_analysis(&self, fp: &str, source_id: &str) -> Option<DocumentAnalysis> {
        match self.cache.get(fp).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(analysis) => {
                    debug!("{}: cache hit", source_id);
                    Some(analysis)
                }
                Err(e) => {
                    warn!("{}: discarding undecodable cache entry: {}", source_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("{}: cache read failed: {}", source_id, e);
                None
            }
        }
    }

    async fn compute_analysis(
        &self,
        source_id: String,
        document: FiscalDocument,
        warnings: Vec<CoercionWarning>,
        context: &BatchContext,
        fp: Option<String>,
        started: Instant,
    ) -> DocumentAnalysis {
        let classifier = Classifier::new(
            &self.config.classification,
            &self.reference,
            self.client.as_deref(),
        );
        let classifications = classifier.classify_document(&document.items).await;
        debug!("{}: classified {} items", source_id, classifications.len());

        let findings = detect::run_all(&DetectionInput {
            document: &document,
            classifications: &classifications,
            context,
            reference: &self.reference,
            registry: &self.registry,
            config: &self.config,
        });
        debug!("{}: {} findings", source_id, findings.len());

        let risk_score = aggregate_score(&findings);
        let risk_level = RiskLevel::from_score(risk_score);
        debug!("{}: scored {:.2} ({:?})", source_id, risk_score, risk_level);

        DocumentAnalysis {
            source_id,
            document: Some(document),
            fingerprint: fp,
            classifications,
            findings,
            warnings,
            risk_score,
            risk_level,
            status: AnalysisStatus::Complete,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Markup or tabular, by extension first and leading byte second.
fn looks_like_markup(file: &InputFile) -> bool {
    let name = file.name.to_ascii_lowercase();
    if name.ends_with(".xml") {
        return true;
    }
    if name.ends_with(".csv") || name.ends_with(".tsv") || name.ends_with(".txt") {
        return false;
    }
    let bytes = file
        .bytes
        .strip_prefix(&[0xEF, 0xBB, 0xBF])
        .unwrap_or(&file.bytes);
    bytes.iter().find(|b| !b.is_ascii_whitespace()).copied() == Some(b'<')
}

/// Confidence-weighted mean of finding severities, amplified for multiple
/// findings (x1.1 for 2, x1.2 for 3, x1.3 for 4 or more) and for breadth
/// (x1.15 when 3 or more distinct detector kinds fired), capped at 100 and
/// rounded to 2 decimals.
pub fn aggregate_score(findings: &[FraudFinding]) -> f64 {
    if findings.is_empty() {
        return 0.0;
    }
    let weight: f64 = findings.iter().map(|f| f.confidence).sum();
    let mut score = if weight > 0.0 {
        findings
            .iter()
            .map(|f| f.severity * f.confidence)
            .sum::<f64>()
            / weight
    } else {
        findings.iter().map(|f| f.severity).sum::<f64>() / findings.len() as f64
    };
    score = match findings.len() {
        0 | 1 => score,
        2 => score * 1.1,
        3 => score * 1.2,
        _ => score * 1.3,
    };
    score = score.min(100.0);
    let distinct: BTreeSet<_> = findings.iter().map(|f| f.kind).collect();
    if distinct.len() >= 3 {
        score = (score * 1.15).min(100.0);
    }
    (score * 100.0).round() / 100.0
}

fn summarize(documents: &[DocumentAnalysis]) -> BatchSummary {
    let mut summary = BatchSummary {
        total_documents: documents.len(),
        complete: 0,
        failed: 0,
        total_declared_value: Decimal::ZERO,
        findings_by_kind: BTreeMap::new(),
        documents_by_level: BTreeMap::new(),
    };
    for analysis in documents {
        if !analysis.status.is_complete() {
            summary.failed += 1;
            continue;
        }
        summary.complete += 1;
        if let Some(document) = &analysis.document {
            summary.total_declared_value += document.declared_total;
        }
        *summary
            .documents_by_level
            .entry(analysis.risk_level)
            .or_insert(0) += 1;
        for finding in &analysis.findings {
            *summary.findings_by_kind.entry(finding.kind).or_insert(0) += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::schema::DetectorKind;

    fn finding(kind: DetectorKind, severity: f64, confidence: f64) -> FraudFinding {
        FraudFinding {
            kind,
            severity,
            confidence,
            evidence: String::new(),
            item_number: None,
        }
    }

    #[test]
    fn test_aggregate_score_weighted_mean() {
        assert_eq!(aggregate_score(&[]), 0.0);

        let single = [finding(DetectorKind::Underpricing, 50.0, 0.8)];
        assert!((aggregate_score(&single) - 50.0).abs() < 1e-9);

        // (60*1.0 + 30*0.5) / 1.5 = 50, then x1.1 for two findings.
        let pair = [
            finding(DetectorKind::Underpricing, 60.0, 1.0),
            finding(DetectorKind::ValueInconsistency, 30.0, 0.5),
        ];
        assert!((aggregate_score(&pair) - 55.0).abs() < 1e-9);
        println!("✓ weighted mean and pair multiplier");
    }

    #[test]
    fn test_aggregate_score_breadth_multiplier() {
        // mean 40, x1.2 for three findings, x1.15 for three distinct kinds.
        let trio = [
            finding(DetectorKind::Underpricing, 40.0, 1.0),
            finding(DetectorKind::Splitting, 40.0, 1.0),
            finding(DetectorKind::TemporalAnomaly, 40.0, 1.0),
        ];
        assert!((aggregate_score(&trio) - 55.2).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_score_caps_at_100() {
        let four = [
            finding(DetectorKind::Underpricing, 90.0, 1.0),
            finding(DetectorKind::Splitting, 90.0, 1.0),
            finding(DetectorKind::TemporalAnomaly, 90.0, 1.0),
            finding(DetectorKind::Triangulation, 90.0, 1.0),
        ];
        assert_eq!(aggregate_score(&four), 100.0);
    }

    fn orchestrator() -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(
            AuditConfig::default(),
            ReferenceTable::builtin_demo(),
            RiskRegistry::default(),
            Arc::new(MemoryCache::new(None)),
            None,
        )
    }

    const CSV: &str = "\
data_emissao,cnpj_emitente,descricao,ncm,quantidade,valor_unitario,valor_total
2024-03-12 10:00:00,11222333000181,Smartphone Galaxy A54 128GB,85171231,1,2500,2500
2024-03-12 11:00:00,11222333000181,Notebook Dell Inspiron 15,84713012,1,3200,3200
2024-03-12 12:00:00,,Cabo USB,85444200,1,20,20
";

    #[tokio::test]
    async fn test_run_batch_reports_in_input_order() {
        let files = [InputFile::new("lote.csv", CSV.as_bytes().to_vec())];
        let report = orchestrator().run_batch(&files, &CancellationToken::new()).await;

        assert_eq!(report.documents.len(), 3);
        assert_eq!(report.documents[0].source_id, "lote.csv#1");
        assert_eq!(report.documents[1].source_id, "lote.csv#2");
        assert_eq!(report.documents[2].source_id, "lote.csv#3");
        assert!(report.documents[0].status.is_complete());
        assert!(report.documents[1].status.is_complete());
        assert!(!report.documents[2].status.is_complete());

        assert_eq!(report.summary.total_documents, 3);
        assert_eq!(report.summary.complete, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.total_declared_value, Decimal::new(5_700, 0));
        println!("✓ batch of 3 rows: 2 complete, 1 failed, order kept");
    }

    #[tokio::test]
    async fn test_unreadable_file_becomes_one_failed_entry() {
        let files = [
            InputFile::new("broken.xml", b"<nfeProc><infNFe>".to_vec()),
            InputFile::new("lote.csv", CSV.as_bytes().to_vec()),
        ];
        let report = orchestrator().run_batch(&files, &CancellationToken::new()).await;

        assert_eq!(report.documents.len(), 4);
        assert_eq!(report.documents[0].source_id, "broken.xml");
        assert!(!report.documents[0].status.is_complete());
        assert_eq!(report.summary.complete, 2);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_fails_every_document() {
        let files = [InputFile::new("lote.csv", CSV.as_bytes().to_vec())];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = orchestrator().run_batch(&files, &cancel).await;

        assert_eq!(report.documents.len(), 3);
        for analysis in &report.documents[..2] {
            match &analysis.status {
                AnalysisStatus::Failed { reason } => {
                    assert!(reason.contains("cancelled"), "reason: {}", reason)
                }
                AnalysisStatus::Complete => panic!("document completed despite cancellation"),
            }
        }
        println!("✓ pre-cancelled batch reports every document as failed");
    }

    #[test]
    fn test_markup_sniffing() {
        assert!(looks_like_markup(&InputFile::new(
            "notas.xml",
            b"irrelevant".to_vec()
        )));
        assert!(!looks_like_markup(&InputFile::new(
            "notas.csv",
            b"<xml-looking>".to_vec()
        )));
        assert!(looks_like_markup(&InputFile::new(
            "payload.bin",
            b"  <nfeProc>".to_vec()
        )));
        assert!(!looks_like_markup(&InputFile::new(
            "payload.bin",
            b"a;b;c".to_vec()
        )));
    }
}
