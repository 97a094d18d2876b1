//! CSV export of application records.
//!
//! Cells that a spreadsheet would evaluate as a formula are prefixed with `'`.

use std::borrow::Cow;

use crate::record::{clamp_string, ApplicationRecord};

const DEFAULT_EXPORT_NAME: &str = "bursary-export.csv";

pub const EXPORT_COLUMNS: [&str; 15] = [
    "id",
    "status",
    "origin",
    "full_name",
    "id_number",
    "sub_region",
    "ward",
    "institution",
    "course",
    "fee_balance",
    "requested_amount",
    "awarded_amount",
    "serial_number",
    "is_final_submission",
    "updated_at",
];

/// Escapes one cell. A cell whose first visible character is `=`, `+`, `-` or
/// `@` gains a leading `'` unless it already starts with one.
pub fn csv_escape(value: &str) -> String {
    let formula = value
        .trim_start()
        .starts_with(|ch: char| matches!(ch, '=' | '+' | '-' | '@'));
    let cell: Cow<'_, str> = if formula {
        Cow::Owned(format!("'{value}"))
    } else {
        Cow::Borrowed(value)
    };
    if cell.contains(|ch: char| matches!(ch, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.into_owned()
    }
}

fn record_cells(record: &ApplicationRecord) -> [String; 15] {
    let award = record.award.as_ref();
    [
        record.id.to_string(),
        record.status.as_str().to_string(),
        record.origin.as_str().to_string(),
        record.personal.full_name.clone(),
        record.personal.id_number.clone(),
        record.location.sub_region.clone(),
        record.location.ward.clone(),
        record.education.institution.clone(),
        record.education.course.clone(),
        record.financial.fee_balance().to_string(),
        record.requested_amount.to_string(),
        award.map(|a| a.amount.to_string()).unwrap_or_default(),
        award.map(|a| a.serial_number.to_string()).unwrap_or_default(),
        record.is_final_submission.to_string(),
        record.updated_at.to_rfc3339(),
    ]
}

pub fn records_to_csv<'a>(records: impl IntoIterator<Item = &'a ApplicationRecord>) -> String {
    let mut lines: Vec<String> = vec![EXPORT_COLUMNS.join(",")];
    for record in records {
        let line = record_cells(record)
            .iter()
            .map(|cell| csv_escape(cell.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(line);
    }
    lines.join("\n")
}

/// Flat file name for a save dialog: ASCII letters, digits, `-` and `_`, with
/// a lowercase `.csv` extension. Falls back to `bursary-export.csv`.
pub fn export_file_name(requested: &str) -> String {
    let requested = clamp_string(requested, 255);
    let mut stem = requested.trim();
    let split = stem.len().saturating_sub(4);
    if let (Some(head), Some(ext)) = (stem.get(..split), stem.get(split..)) {
        if ext.eq_ignore_ascii_case(".csv") {
            stem = head;
        }
    }
    let stem: String = stem
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    match stem.trim_matches('_') {
        "" => DEFAULT_EXPORT_NAME.to_string(),
        stem => format!("{stem}.csv"),
    }
}
