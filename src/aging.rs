//! A/R aging summary
//!
//! Turns the QuickBooks `AgedReceivableDetail` report into one row per customer
//! with open balances grouped into collection buckets and a recommended next
//! step. Pure transformation; amounts are summed in minor units.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::connectors::records::parse_minor_units;

/// Aging bucket, ordered from current to oldest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Current,
    Days1To20,
    Days21To30,
    Days31To45,
    Days46To60,
    Days61To90,
    Over90,
}

impl Bucket {
    pub fn for_days_past_due(days: i64) -> Self {
        match days {
            d if d <= 0 => Bucket::Current,
            1..=20 => Bucket::Days1To20,
            21..=30 => Bucket::Days21To30,
            31..=45 => Bucket::Days31To45,
            46..=60 => Bucket::Days46To60,
            61..=90 => Bucket::Days61To90,
            _ => Bucket::Over90,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Current => "current",
            Bucket::Days1To20 => "1-20",
            Bucket::Days21To30 => "21-30",
            Bucket::Days31To45 => "31-45",
            Bucket::Days46To60 => "46-60",
            Bucket::Days61To90 => "61-90",
            Bucket::Over90 => "91+",
        }
    }

    pub fn recommended_action(self) -> &'static str {
        match self {
            Bucket::Current => "No Action",
            Bucket::Days1To20 | Bucket::Days21To30 => "Accounting Outreach",
            Bucket::Days31To45 => "CSM/AE Outreach",
            Bucket::Days46To60 => "Management Escalation",
            Bucket::Days61To90 => "Demand Letter",
            Bucket::Over90 => "Collections Review",
        }
    }
}

/// Open balance per bucket; every key is always present
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct AgingBuckets {
    pub current: f64,
    #[serde(rename = "1-20")]
    pub days_1_20: f64,
    #[serde(rename = "21-30")]
    pub days_21_30: f64,
    #[serde(rename = "31-45")]
    pub days_31_45: f64,
    #[serde(rename = "46-60")]
    pub days_46_60: f64,
    #[serde(rename = "61-90")]
    pub days_61_90: f64,
    #[serde(rename = "91+")]
    pub days_91_plus: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OldestInvoice {
    pub doc_num: Option<String>,
    pub txn_type: String,
    pub due_date: Option<NaiveDate>,
    pub days_past_due: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CustomerAging {
    pub customer: String,
    pub total_balance: f64,
    pub buckets: AgingBuckets,
    /// Sum of negative open balances (credit memos, unapplied payments)
    pub credits: f64,
    pub recommended_bucket: Option<String>,
    pub recommended_action: Option<String>,
    pub oldest_invoice: Option<OldestInvoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SimplifiedAgingReport {
    /// `Header.Time` of the source report
    pub generated_at: Option<String>,
    /// Customers owing money, largest balance first
    pub rows: Vec<CustomerAging>,
}

#[derive(Debug, Clone)]
struct AgingTransaction {
    customer: String,
    doc_num: Option<String>,
    txn_type: String,
    due_date: Option<NaiveDate>,
    days_past_due: i64,
    bucket: Bucket,
    amount_minor: i64,
}

#[derive(Default)]
struct CustomerTotals {
    customer: String,
    total_minor: i64,
    credits_minor: i64,
    buckets_minor: [i64; 7],
    positive: Vec<AgingTransaction>,
}

/// Summarize a raw `AgedReceivableDetail` payload.
///
/// `today` is the report date used when the header does not carry one.
pub fn simplify_aging_report(report: &Value, today: NaiveDate) -> SimplifiedAgingReport {
    let mut order: Vec<String> = Vec::new();
    let mut customers: HashMap<String, CustomerTotals> = HashMap::new();

    for txn in extract_transactions(report, today) {
        let key = customer_key(&txn.customer);
        let totals = customers.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            CustomerTotals {
                customer: txn.customer.clone(),
                ..CustomerTotals::default()
            }
        });

        totals.total_minor += txn.amount_minor;
        totals.buckets_minor[txn.bucket as usize] += txn.amount_minor;
        if txn.amount_minor > 0 {
            if totals.positive.is_empty() {
                totals.customer = txn.customer.clone();
            }
            totals.positive.push(txn);
        } else {
            totals.credits_minor += txn.amount_minor;
        }
    }

    let mut rows: Vec<(i64, CustomerAging)> = order
        .into_iter()
        .filter_map(|key| customers.remove(&key))
        .filter(|totals| totals.total_minor > 0)
        .map(|totals| (totals.total_minor, summarize(totals)))
        .collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0));

    SimplifiedAgingReport {
        generated_at: report
            .pointer("/Header/Time")
            .and_then(Value::as_str)
            .map(str::to_string),
        rows: rows.into_iter().map(|(_, row)| row).collect(),
    }
}

fn summarize(totals: CustomerTotals) -> CustomerAging {
    let oldest = totals
        .positive
        .iter()
        .fold(None::<&AgingTransaction>, |oldest, txn| match oldest {
            Some(current) if (txn.bucket, txn.days_past_due) <= (current.bucket, current.days_past_due) => {
                Some(current)
            }
            _ => Some(txn),
        });

    let b = &totals.buckets_minor;
    CustomerAging {
        customer: totals.customer.clone(),
        total_balance: to_major(totals.total_minor),
        buckets: AgingBuckets {
            current: to_major(b[0]),
            days_1_20: to_major(b[1]),
            days_21_30: to_major(b[2]),
            days_31_45: to_major(b[3]),
            days_46_60: to_major(b[4]),
            days_61_90: to_major(b[5]),
            days_91_plus: to_major(b[6]),
        },
        credits: to_major(totals.credits_minor),
        recommended_bucket: oldest.map(|t| t.bucket.as_str().to_string()),
        recommended_action: oldest.map(|t| t.bucket.recommended_action().to_string()),
        oldest_invoice: oldest.map(|t| OldestInvoice {
            doc_num: t.doc_num.clone(),
            txn_type: t.txn_type.clone(),
            due_date: t.due_date,
            days_past_due: t.days_past_due,
            amount: to_major(t.amount_minor),
        }),
    }
}

fn to_major(minor: i64) -> f64 {
    minor as f64 / 100.0
}

fn extract_transactions(report: &Value, today: NaiveDate) -> Vec<AgingTransaction> {
    let report_date = report
        .pointer("/Header/Option")
        .and_then(Value::as_array)
        .and_then(|options| {
            options
                .iter()
                .find(|opt| opt.get("Name").and_then(Value::as_str) == Some("report_date"))
        })
        .and_then(|opt| opt.get("Value").and_then(Value::as_str))
        .and_then(parse_date)
        .unwrap_or(today);

    let columns = column_index(report);
    let mut data_rows = Vec::new();
    if let Some(rows) = report.pointer("/Rows/Row").and_then(Value::as_array) {
        collect_data_rows(rows, &mut data_rows);
    }

    data_rows
        .into_iter()
        .filter_map(|row| {
            let cells = row.get("ColData").and_then(Value::as_array)?;
            let cell = |key: &str| -> Option<&str> {
                let position = *columns.get(key)?;
                cells
                    .get(position)?
                    .get("value")
                    .and_then(Value::as_str)
                    .filter(|v| !v.is_empty())
            };

            let amount_minor = cell("subt_open_bal")
                .and_then(|v| parse_minor_units(v.trim()))
                .unwrap_or(0);
            if amount_minor == 0 {
                return None;
            }

            let due_date = cell("due_date").and_then(parse_date);
            let days_past_due = due_date.map_or(0, |due| (report_date - due).num_days());

            Some(AgingTransaction {
                customer: clean_customer_name(cell("cust_name").unwrap_or("Unknown")),
                doc_num: cell("doc_num").map(str::to_string),
                txn_type: cell("txn_type").unwrap_or_default().to_string(),
                due_date,
                days_past_due,
                bucket: Bucket::for_days_past_due(days_past_due),
                amount_minor,
            })
        })
        .collect()
}

/// Column key to position, from `MetaData[Name=ColKey]` or the column title
fn column_index(report: &Value) -> HashMap<String, usize> {
    let Some(columns) = report.pointer("/Columns/Column").and_then(Value::as_array) else {
        return HashMap::new();
    };

    columns
        .iter()
        .enumerate()
        .filter_map(|(i, column)| {
            let from_metadata = column
                .get("MetaData")
                .and_then(Value::as_array)
                .and_then(|meta| {
                    meta.iter()
                        .find(|m| m.get("Name").and_then(Value::as_str) == Some("ColKey"))
                })
                .and_then(|m| m.get("Value").and_then(Value::as_str))
                .map(str::to_string);

            let key = from_metadata.or_else(|| {
                column
                    .get("ColTitle")
                    .and_then(Value::as_str)
                    .and_then(key_for_title)
                    .map(str::to_string)
            })?;
            Some((key, i))
        })
        .collect()
}

fn key_for_title(title: &str) -> Option<&'static str> {
    match title.trim().to_ascii_lowercase().as_str() {
        "transaction type" => Some("txn_type"),
        "customer" => Some("cust_name"),
        "num" | "no." => Some("doc_num"),
        "open balance" => Some("subt_open_bal"),
        "due date" => Some("due_date"),
        _ => None,
    }
}

fn collect_data_rows<'a>(rows: &'a [Value], out: &mut Vec<&'a Value>) {
    for row in rows {
        if row.get("type").and_then(Value::as_str) == Some("Data") {
            out.push(row);
        }
        if let Some(nested) = row.pointer("/Rows/Row").and_then(Value::as_array) {
            collect_data_rows(nested, out);
        }
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value.get(..10).unwrap_or(value), "%Y-%m-%d").ok()
}

/// Drop sub-customer suffixes (`Parent:Job`) and collapse whitespace
fn clean_customer_name(raw: &str) -> String {
    let head = raw.split(':').next().unwrap_or(raw);
    let collapsed = head.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        raw.trim().to_string()
    } else {
        collapsed
    }
}

fn customer_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
