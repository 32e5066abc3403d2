//! Typed QuickBooks invoice records
//!
//! Maps the loosely typed query payload onto [`InvoiceRecord`]. Anything that does
//! not fit is reported per record so one bad row never hides the rest of a page.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::trait_::{QuickBooksError, SourceRecord};
use crate::models::invoice::{STATUS_OPEN, STATUS_PAID};

/// Invoice fields the sync keeps, amounts in minor currency units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRecord {
    pub external_id: String,
    pub doc_number: Option<String>,
    pub customer_ref: String,
    pub customer_name: String,
    pub amount_minor: i64,
    pub open_balance_minor: i64,
    pub currency: Option<String>,
    pub status: String,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInvoice {
    id: Option<String>,
    doc_number: Option<String>,
    txn_date: Option<String>,
    due_date: Option<String>,
    total_amt: Option<Value>,
    balance: Option<Value>,
    currency_ref: Option<RawRef>,
    customer_ref: Option<RawRef>,
    meta_data: Option<RawMetaData>,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    value: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMetaData {
    last_updated_time: Option<String>,
}

/// Query response envelope: `{"QueryResponse": {"Invoice": [...], ...}, "time": ...}`
#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    #[serde(rename = "QueryResponse")]
    query_response: QueryResponse,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(rename = "Invoice", default)]
    invoice: Vec<Value>,
}

/// Split a query response into per-record results.
///
/// The envelope itself must be well formed; a missing `QueryResponse` fails the
/// whole page.
pub fn parse_invoice_page(body: Value) -> Result<Vec<SourceRecord>, QuickBooksError> {
    let envelope: QueryEnvelope = serde_json::from_value(body)
        .map_err(|e| QuickBooksError::Malformed(format!("unexpected query response: {}", e)))?;

    Ok(envelope
        .query_response
        .invoice
        .into_iter()
        .map(|raw| match parse_invoice(&raw) {
            Ok(record) => SourceRecord::Invoice(record),
            Err(reason) => SourceRecord::Malformed {
                external_id: raw.get("Id").and_then(Value::as_str).map(str::to_string),
                reason,
            },
        })
        .collect())
}

/// Map a single raw invoice object.
pub fn parse_invoice(raw: &Value) -> Result<InvoiceRecord, String> {
    let raw: RawInvoice =
        RawInvoice::deserialize(raw).map_err(|e| format!("invalid invoice shape: {}", e))?;

    let external_id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or("missing Id")?;

    let customer = raw.customer_ref.ok_or("missing CustomerRef")?;
    let customer_ref = customer
        .value
        .filter(|value| !value.trim().is_empty())
        .ok_or("missing CustomerRef.value")?;
    let customer_name = customer
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    let last_modified = raw
        .meta_data
        .and_then(|meta| meta.last_updated_time)
        .ok_or("missing MetaData.LastUpdatedTime")?;
    let last_modified = DateTime::parse_from_rfc3339(&last_modified)
        .map_err(|e| format!("invalid MetaData.LastUpdatedTime '{}': {}", last_modified, e))?
        .with_timezone(&Utc);

    let amount_minor = amount_field(raw.total_amt.as_ref(), "TotalAmt")?;
    let open_balance_minor = amount_field(raw.balance.as_ref(), "Balance")?;

    let status = if open_balance_minor > 0 {
        STATUS_OPEN
    } else {
        STATUS_PAID
    };

    Ok(InvoiceRecord {
        external_id,
        doc_number: raw.doc_number,
        customer_ref,
        customer_name,
        amount_minor,
        open_balance_minor,
        currency: raw.currency_ref.and_then(|c| c.value),
        status: status.to_string(),
        invoice_date: date_field(raw.txn_date.as_deref(), "TxnDate")?,
        due_date: date_field(raw.due_date.as_deref(), "DueDate")?,
        last_modified,
    })
}

fn amount_field(value: Option<&Value>, name: &str) -> Result<i64, String> {
    let text = match value {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return Err(format!("invalid {}: {}", name, other)),
    };
    parse_minor_units(&text).ok_or_else(|| format!("invalid {}: {}", name, text))
}

fn date_field(value: Option<&str>, name: &str) -> Result<Option<NaiveDate>, String> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| format!("invalid {} '{}': {}", name, v, e)),
    }
}

/// Parse a decimal amount into hundredths, rounding half away from zero.
///
/// Works on the textual form so `362.07` stays exactly 36207.
pub fn parse_minor_units(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if digits.is_empty() || digits.contains(['e', 'E']) {
        return None;
    }

    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut cents: i64 = 0;
    let mut fraction_digits = fraction.chars();
    for _ in 0..2 {
        let digit = fraction_digits.next().and_then(|c| c.to_digit(10)).unwrap_or(0);
        cents = cents * 10 + i64::from(digit);
    }
    let round_up = fraction_digits
        .next()
        .and_then(|c| c.to_digit(10))
        .is_some_and(|d| d >= 5);

    let magnitude = whole
        .checked_mul(100)?
        .checked_add(cents)?
        .checked_add(i64::from(round_up))?;
    Some(if negative { -magnitude } else { magnitude })
}
