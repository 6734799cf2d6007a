//! Encoding-aware reader for delimited-text inputs. Detects the character
//! encoding (statistical guess first, then a fixed fallback ladder) and the
//! field delimiter, then produces ordered column-name-to-value rows.

use std::collections::BTreeMap;

use chardetng::EncodingDetector;
use log::debug;

use crate::error::{FiscalAuditError, Result};

const DELIMITER_CANDIDATES: [char; 5] = [',', ';', '\t', '|', ' '];
const SAMPLE_LINES: usize = 10;

/// One decoded tabular file: which encoding and delimiter were chosen, and
/// the rows in input order.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub encoding: String,
    pub delimiter: char,
    pub rows: Vec<BTreeMap<String, String>>,
}

/// Reads a delimited-text file into rows, or fails with `UnreadableEncoding`
/// when no candidate encoding decodes the full byte stream.
pub fn read_table(source_name: &str, bytes: &[u8]) -> Result<RawTable> {
    let (text, encoding) = decode_text(source_name, bytes)?;
    let delimiter = detect_delimiter(&text);
    debug!(
        "{}: decoded as {} with delimiter {:?}",
        source_name, encoding, delimiter
    );

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| FiscalAuditError::MalformedDocument {
            source_name: source_name.to_string(),
            details: format!("unreadable header row: {}", e),
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| FiscalAuditError::MalformedDocument {
            source_name: source_name.to_string(),
            details: format!("unreadable row: {}", e),
        })?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let mut row = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            let value = record.get(i).unwrap_or("").trim().to_string();
            row.insert(header.clone(), value);
        }
        rows.push(row);
    }

    Ok(RawTable {
        encoding,
        delimiter,
        rows,
    })
}

/// Decodes raw bytes with the candidate ladder: strict UTF-8 (BOM-aware),
/// the chardetng guess, then Latin-1, Windows-1252, ISO-8859-1, DOS-850 and
/// ASCII in priority order. Latin-1 maps every byte, so in practice the
/// ladder ends there; the order is still the contract for the earlier,
/// partial candidates. Returns the text and the chosen encoding label.
pub(crate) fn decode_text(source_name: &str, bytes: &[u8]) -> Result<(String, String)> {
    if let Some(stripped) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(text) = std::str::from_utf8(stripped) {
            return Ok((text.to_string(), "utf-8-sig".to_string()));
        }
    } else if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok((text.to_string(), "utf-8".to_string()));
    }

    // Statistical guess, biased toward Brazilian content. chardetng exposes
    // no confidence value, so a failed strict decode of the guess simply
    // advances to the fixed ladder.
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let guess = detector.guess(Some(b"br"), false);
    if guess != encoding_rs::UTF_8 {
        if let Some(text) = guess.decode_without_bom_handling_and_without_replacement(bytes) {
            return Ok((text.into_owned(), guess.name().to_ascii_lowercase()));
        }
    }

    const FALLBACKS: &[(&str, fn(&[u8]) -> Option<String>)] = &[
        ("latin-1", decode_latin1),
        ("windows-1252", decode_windows_1252),
        ("iso-8859-1", decode_latin1),
        ("cp850", decode_cp850),
        ("ascii", decode_ascii),
    ];
    for (label, decode) in FALLBACKS {
        if let Some(text) = decode(bytes) {
            return Ok((text, label.to_string()));
        }
    }

    Err(FiscalAuditError::UnreadableEncoding {
        source_name: source_name.to_string(),
    })
}

fn decode_latin1(bytes: &[u8]) -> Option<String> {
    Some(bytes.iter().map(|&b| b as char).collect())
}

fn decode_windows_1252(bytes: &[u8]) -> Option<String> {
    encoding_rs::WINDOWS_1252
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

fn decode_cp850(bytes: &[u8]) -> Option<String> {
    Some(oem_cp::decode_string_complete_table(
        bytes,
        &oem_cp::code_table::DECODING_TABLE_CP850,
    ))
}

fn decode_ascii(bytes: &[u8]) -> Option<String> {
    bytes
        .is_ascii()
        .then(|| String::from_utf8_lossy(bytes).into_owned())
}

/// Scores each candidate delimiter by how consistently it splits the sampled
/// lines into the same column count, requiring at least 2 columns. Ties go
/// to candidate order; a sample with no usable candidate falls back to ','.
fn detect_delimiter(text: &str) -> char {
    let sample: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(SAMPLE_LINES)
        .collect();
    if sample.is_empty() {
        return ',';
    }

    let mut best = (',', 0.0f64);
    for candidate in DELIMITER_CANDIDATES {
        let counts: Vec<usize> = sample
            .iter()
            .map(|line| line.split(candidate).count())
            .collect();
        let Some(modal) = modal_count(&counts) else {
            continue;
        };
        if modal.0 < 2 {
            continue;
        }
        let score = modal.1 as f64 / counts.len() as f64;
        if score > best.1 {
            best = (candidate, score);
        }
    }
    best.0
}

/// Most frequent column count and its frequency, preferring the higher
/// count on frequency ties.
fn modal_count(counts: &[usize]) -> Option<(usize, usize)> {
    let mut frequency: BTreeMap<usize, usize> = BTreeMap::new();
    for &count in counts {
        *frequency.entry(count).or_insert(0) += 1;
    }
    frequency
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}
