//! Document extractor: turns raw markup field trees and tabular rows into
//! canonical [`FiscalDocument`]s. Extraction is pure with respect to the
//! environment: no clock reads, no network, so the same bytes always yield
//! the same document. Recoverable normalizations are reported as
//! [`CoercionWarning`]s instead of being applied silently.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::ExtractionConfig;
use crate::error::{FiscalAuditError, Result};
use crate::markup::XmlNode;
use crate::schema::{is_valid_access_key, CoercionWarning, DocumentKind, FiscalDocument, LineItem};

/// Extracts one document from one markup record tree.
pub fn from_markup(
    config: &ExtractionConfig,
    record_id: &str,
    kind: DocumentKind,
    record: &XmlNode,
) -> Result<(FiscalDocument, Vec<CoercionWarning>)> {
    match kind {
        DocumentKind::Invoice => invoice_from_record(config, record_id, record),
        DocumentKind::ServiceNote => service_note_from_record(record_id, record),
    }
}

fn invoice_from_record(
    config: &ExtractionConfig,
    record_id: &str,
    record: &XmlNode,
) -> Result<(FiscalDocument, Vec<CoercionWarning>)> {
    let mut warnings = Vec::new();

    let access_key = record
        .attr("Id")
        .map(|id| id.strip_prefix("NFe").unwrap_or(id).trim().to_string())
        .and_then(|key| {
            if is_valid_access_key(&key) {
                Some(key)
            } else {
                warnings.push(CoercionWarning {
                    field: "infNFe/Id".to_string(),
                    original: key,
                    coerced: String::new(),
                });
                None
            }
        });

    let issued_raw = [
        ("ide/dhEmi", ["ide", "dhEmi"]),
        ("ide/dEmi", ["ide", "dEmi"]),
        ("ide/dhSaiEnt", ["ide", "dhSaiEnt"]),
        ("ide/dSaiEnt", ["ide", "dSaiEnt"]),
    ]
    .iter()
    .find_map(|(name, path)| record.text_at(path).map(|value| (*name, value)))
    .ok_or_else(|| incomplete(record_id, "ide/dhEmi"))?;
    let issued_at = parse_datetime(issued_raw.0, &issued_raw.1)?;

    let issuer_raw = record
        .text_at(&["emit", "CNPJ"])
        .or_else(|| record.text_at(&["emit", "CPF"]))
        .ok_or_else(|| incomplete(record_id, "emit/CNPJ"))?;
    let issuer_tax_id = normalize_tax_id("emit/CNPJ", &issuer_raw, &mut warnings);

    let recipient_tax_id = record
        .text_at(&["dest", "CNPJ"])
        .or_else(|| record.text_at(&["dest", "CPF"]))
        .map(|raw| normalize_tax_id("dest/CNPJ", &raw, &mut warnings));

    let total_raw = record
        .text_at(&["total", "ICMSTot", "vNF"])
        .ok_or_else(|| incomplete(record_id, "total/ICMSTot/vNF"))?;
    let declared_total = parse_decimal("total/ICMSTot/vNF", &total_raw)?;
    let declared_tax = record
        .text_at(&["total", "ICMSTot", "vTotTrib"])
        .map(|raw| parse_decimal("total/ICMSTot/vTotTrib", &raw))
        .transpose()?;

    let mut items = Vec::new();
    for (index, det) in record.children_named("det").into_iter().enumerate() {
        let prod = det
            .child("prod")
            .ok_or_else(|| incomplete(record_id, "det/prod"))?;
        let number = det
            .attr("nItem")
            .and_then(|n| n.trim().parse::<u32>().ok())
            .unwrap_or(index as u32 + 1);
        items.push(line_item_from_prod(config, record_id, number, prod, &mut warnings)?);
    }
    if items.is_empty() {
        return Err(incomplete(record_id, "det"));
    }

    let document = FiscalDocument {
        access_key,
        kind: DocumentKind::Invoice,
        number: record.text_at(&["ide", "nNF"]),
        series: record.text_at(&["ide", "serie"]),
        issuer_tax_id,
        issuer_name: record.text_at(&["emit", "xNome"]),
        recipient_tax_id,
        recipient_name: record.text_at(&["dest", "xNome"]),
        issued_at,
        declared_total,
        declared_tax,
        items,
    };
    Ok((document, warnings))
}

fn line_item_from_prod(
    config: &ExtractionConfig,
    record_id: &str,
    number: u32,
    prod: &XmlNode,
    warnings: &mut Vec<CoercionWarning>,
) -> Result<LineItem> {
    let description = prod
        .text_at(&["xProd"])
        .ok_or_else(|| incomplete(record_id, "det/prod/xProd"))?;
    let declared_code = prod
        .text_at(&["NCM"])
        .map(|raw| digits_only(&raw))
        .unwrap_or_default();
    let operation_code = prod
        .text_at(&["CFOP"])
        .map(|raw| digits_only(&raw))
        .unwrap_or_else(|| "0000".to_string());
    let unit = prod
        .text_at(&["uCom"])
        .unwrap_or_else(|| "UN".to_string());

    let quantity = match prod.text_at(&["qCom"]) {
        Some(raw) => parse_decimal("det/prod/qCom", &raw)?,
        None => {
            warnings.push(CoercionWarning {
                field: "det/prod/qCom".to_string(),
                original: String::new(),
                coerced: "1".to_string(),
            });
            Decimal::ONE
        }
    };

    let declared_line_total = prod
        .text_at(&["vProd"])
        .map(|raw| parse_decimal("det/prod/vProd", &raw))
        .transpose()?;
    let declared_unit_price = prod
        .text_at(&["vUnCom"])
        .map(|raw| parse_decimal("det/prod/vUnCom", &raw))
        .transpose()?;

    let (unit_price, line_total) = match (declared_unit_price, declared_line_total) {
        (Some(unit_price), Some(line_total)) => {
            check_line_math(config, number, quantity, unit_price, line_total, warnings);
            (unit_price, line_total)
        }
        (Some(unit_price), None) => {
            let computed = quantity * unit_price;
            warnings.push(CoercionWarning {
                field: "det/prod/vProd".to_string(),
                original: String::new(),
                coerced: computed.to_string(),
            });
            (unit_price, computed)
        }
        (None, Some(line_total)) => {
            if quantity.is_zero() {
                return Err(incomplete(record_id, "det/prod/vUnCom"));
            }
            let computed = line_total / quantity;
            warnings.push(CoercionWarning {
                field: "det/prod/vUnCom".to_string(),
                original: String::new(),
                coerced: computed.to_string(),
            });
            (computed, line_total)
        }
        (None, None) => return Err(incomplete(record_id, "det/prod/vUnCom")),
    };

    Ok(LineItem {
        number,
        product_code: prod.text_at(&["cProd"]),
        description,
        declared_code,
        unit,
        quantity,
        unit_price,
        line_total,
        operation_code,
    })
}

fn service_note_from_record(
    record_id: &str,
    record: &XmlNode,
) -> Result<(FiscalDocument, Vec<CoercionWarning>)> {
    let mut warnings = Vec::new();

    let issued_raw = record
        .text_at(&["DataEmissao"])
        .ok_or_else(|| incomplete(record_id, "DataEmissao"))?;
    let issued_at = parse_datetime("DataEmissao", &issued_raw)?;

    let issuer_raw = record
        .text_at(&["PrestadorServico", "IdentificacaoPrestador", "Cnpj"])
        .or_else(|| record.text_at(&["PrestadorServico", "IdentificacaoPrestador", "Cpf"]))
        .ok_or_else(|| incomplete(record_id, "PrestadorServico/IdentificacaoPrestador/Cnpj"))?;
    let issuer_tax_id =
        normalize_tax_id("PrestadorServico/IdentificacaoPrestador/Cnpj", &issuer_raw, &mut warnings);

    let recipient_tax_id = record
        .text_at(&["TomadorServico", "IdentificacaoTomador", "CpfCnpj", "Cnpj"])
        .or_else(|| record.text_at(&["TomadorServico", "IdentificacaoTomador", "CpfCnpj", "Cpf"]))
        .map(|raw| {
            normalize_tax_id(
                "TomadorServico/IdentificacaoTomador/CpfCnpj",
                &raw,
                &mut warnings,
            )
        });

    let total_raw = record
        .text_at(&["Servico", "Valores", "ValorServicos"])
        .ok_or_else(|| incomplete(record_id, "Servico/Valores/ValorServicos"))?;
    let declared_total = parse_decimal("Servico/Valores/ValorServicos", &total_raw)?;
    let declared_tax = record
        .text_at(&["Servico", "Valores", "ValorIss"])
        .map(|raw| parse_decimal("Servico/Valores/ValorIss", &raw))
        .transpose()?;

    let declared_code = record
        .text_at(&["Servico", "ItemListaServico"])
        .map(|raw| pad_service_code(digits_only(&raw), &mut warnings))
        .unwrap_or_default();

    let item = LineItem {
        number: 1,
        product_code: None,
        description: record
            .text_at(&["Servico", "Discriminacao"])
            .unwrap_or_default(),
        declared_code,
        unit: "UN".to_string(),
        quantity: Decimal::ONE,
        unit_price: declared_total,
        line_total: declared_total,
        operation_code: "0000".to_string(),
    };

    let document = FiscalDocument {
        access_key: None,
        kind: DocumentKind::ServiceNote,
        number: record.text_at(&["Numero"]),
        series: None,
        issuer_tax_id,
        issuer_name: record.text_at(&["PrestadorServico", "RazaoSocial"]),
        recipient_tax_id,
        recipient_name: record.text_at(&["TomadorServico", "RazaoSocial"]),
        issued_at,
        declared_total,
        declared_tax,
        items: vec![item],
    };
    Ok((document, warnings))
}

/// Extracts one single-line document from one tabular row. Column names are
/// matched case-insensitively against Portuguese and English aliases.
pub fn from_row(
    config: &ExtractionConfig,
    record_id: &str,
    row: &BTreeMap<String, String>,
) -> Result<(FiscalDocument, Vec<CoercionWarning>)> {
    let mut warnings = Vec::new();

    let access_key = row_value(row, &["chave_acesso", "chave", "access_key"]).and_then(|raw| {
        let key = raw.trim().to_string();
        if is_valid_access_key(&key) {
            Some(key)
        } else {
            warnings.push(CoercionWarning {
                field: "chave_acesso".to_string(),
                original: key,
                coerced: String::new(),
            });
            None
        }
    });

    let issued_raw = row_value(row, &["data_emissao", "data", "issue_date", "emissao"])
        .ok_or_else(|| incomplete(record_id, "data_emissao"))?;
    let issued_at = parse_datetime("data_emissao", issued_raw)?;

    let issuer_raw = row_value(row, &["cnpj_emitente", "emitente_cnpj", "issuer_tax_id", "cnpj"])
        .ok_or_else(|| incomplete(record_id, "cnpj_emitente"))?;
    let issuer_tax_id = normalize_tax_id("cnpj_emitente", issuer_raw, &mut warnings);

    let recipient_tax_id =
        row_value(row, &["cnpj_destinatario", "destinatario_cnpj", "recipient_tax_id"])
            .map(|raw| normalize_tax_id("cnpj_destinatario", raw, &mut warnings));

    let quantity = match row_value(row, &["quantidade", "qtd", "quantity"]) {
        Some(raw) => parse_decimal("quantidade", raw)?,
        None => {
            warnings.push(CoercionWarning {
                field: "quantidade".to_string(),
                original: String::new(),
                coerced: "1".to_string(),
            });
            Decimal::ONE
        }
    };
    let declared_unit_price =
        row_value(row, &["valor_unitario", "preco_unitario", "unit_price"])
            .map(|raw| parse_decimal("valor_unitario", raw))
            .transpose()?;
    let declared_line_total =
        row_value(row, &["valor_total", "total", "valor", "line_total"])
            .map(|raw| parse_decimal("valor_total", raw))
            .transpose()?;

    let (unit_price, line_total) = match (declared_unit_price, declared_line_total) {
        (Some(unit_price), Some(line_total)) => {
            check_line_math(config, 1, quantity, unit_price, line_total, &mut warnings);
            (unit_price, line_total)
        }
        (Some(unit_price), None) => {
            let computed = quantity * unit_price;
            warnings.push(CoercionWarning {
                field: "valor_total".to_string(),
                original: String::new(),
                coerced: computed.to_string(),
            });
            (unit_price, computed)
        }
        (None, Some(line_total)) => {
            if quantity.is_zero() {
                return Err(incomplete(record_id, "valor_unitario"));
            }
            let computed = line_total / quantity;
            warnings.push(CoercionWarning {
                field: "valor_unitario".to_string(),
                original: String::new(),
                coerced: computed.to_string(),
            });
            (computed, line_total)
        }
        (None, None) => return Err(incomplete(record_id, "valor_total")),
    };

    let declared_tax = row_value(row, &["valor_tributos", "tributos", "declared_tax"])
        .map(|raw| parse_decimal("valor_tributos", raw))
        .transpose()?;

    let item = LineItem {
        number: 1,
        product_code: row_value(row, &["codigo_produto", "codigo", "product_code", "sku"])
            .map(|v| v.to_string()),
        description: row_value(row, &["descricao", "descricao_produto", "description"])
            .map(|v| v.to_string())
            .unwrap_or_default(),
        declared_code: row_value(row, &["ncm", "codigo_ncm", "classification_code"])
            .map(digits_only)
            .unwrap_or_default(),
        unit: row_value(row, &["unidade", "unit", "um"])
            .map(|v| v.to_string())
            .unwrap_or_else(|| "UN".to_string()),
        quantity,
        unit_price,
        line_total,
        operation_code: row_value(row, &["cfop", "operation_code"])
            .map(digits_only)
            .unwrap_or_else(|| "0000".to_string()),
    };

    let document = FiscalDocument {
        access_key,
        kind: DocumentKind::Invoice,
        number: row_value(row, &["numero_nota", "numero", "number"]).map(|v| v.to_string()),
        series: row_value(row, &["serie", "series"]).map(|v| v.to_string()),
        issuer_tax_id,
        issuer_name: row_value(row, &["razao_social_emitente", "nome_emitente", "issuer_name"])
            .map(|v| v.to_string()),
        recipient_tax_id,
        recipient_name: row_value(
            row,
            &["razao_social_destinatario", "nome_destinatario", "recipient_name"],
        )
        .map(|v| v.to_string()),
        issued_at,
        declared_total: line_total,
        declared_tax,
        items: vec![item],
    };
    Ok((document, warnings))
}

fn row_value<'a>(row: &'a BTreeMap<String, String>, aliases: &[&str]) -> Option<&'a str> {
    for alias in aliases {
        for (key, value) in row {
            if key.trim().eq_ignore_ascii_case(alias) && !value.trim().is_empty() {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Records a warning when quantity x unit price disagrees with the declared
/// line total beyond the relative tolerance. The declared value stays
/// authoritative either way.
fn check_line_math(
    config: &ExtractionConfig,
    item_number: u32,
    quantity: Decimal,
    unit_price: Decimal,
    line_total: Decimal,
    warnings: &mut Vec<CoercionWarning>,
) {
    let expected = quantity * unit_price;
    let base = std::cmp::max(expected.abs(), line_total.abs());
    if base.is_zero() {
        return;
    }
    let relative = ((expected - line_total).abs() / base)
        .to_f64()
        .unwrap_or(0.0);
    if relative > config.line_total_relative_tolerance {
        warnings.push(CoercionWarning {
            field: format!("item {} line total", item_number),
            original: line_total.to_string(),
            coerced: format!("{} expected from quantity x unit price", expected),
        });
    }
}

fn normalize_tax_id(field: &str, raw: &str, warnings: &mut Vec<CoercionWarning>) -> String {
    let digits = digits_only(raw);
    if digits.len() == 11 {
        let padded = format!("{:0>14}", digits);
        warnings.push(CoercionWarning {
            field: field.to_string(),
            original: digits,
            coerced: padded.clone(),
        });
        padded
    } else {
        digits
    }
}

fn pad_service_code(code: String, warnings: &mut Vec<CoercionWarning>) -> String {
    if !code.is_empty() && code.len() < 8 {
        let padded = format!("{:0<8}", code);
        warnings.push(CoercionWarning {
            field: "Servico/ItemListaServico".to_string(),
            original: code,
            coerced: padded.clone(),
        });
        padded
    } else {
        code
    }
}

fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim().trim_start_matches("R$").trim_start();
    let normalized = if trimmed.contains(',') && trimmed.contains('.') {
        if trimmed.rfind(',') > trimmed.rfind('.') {
            trimmed.replace('.', "").replace(',', ".")
        } else {
            trimmed.replace(',', "")
        }
    } else if trimmed.contains(',') {
        trimmed.replace(',', ".")
    } else {
        trimmed.to_string()
    };
    normalized
        .parse::<Decimal>()
        .map_err(|e| FiscalAuditError::InvalidFieldValue {
            field: field.to_string(),
            details: format!("unparseable number '{}': {}", raw.trim(), e),
        })
}

fn parse_datetime(field: &str, raw: &str) -> Result<NaiveDateTime> {
    let trimmed = raw.trim();
    if let Ok(offset_datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(offset_datetime.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(datetime);
        }
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            if let Some(datetime) = date.and_hms_opt(0, 0, 0) {
                return Ok(datetime);
            }
        }
    }
    Err(FiscalAuditError::InvalidFieldValue {
        field: field.to_string(),
        details: format!("unparseable timestamp '{}'", trimmed),
    })
}

fn incomplete(record_id: &str, field: &str) -> FiscalAuditError {
    FiscalAuditError::IncompleteRecord {
        record: record_id.to_string(),
        field: field.to_string(),
    }
}
