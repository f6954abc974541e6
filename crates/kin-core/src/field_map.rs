//! Field renaming between record objects (camelCase) and remote rows
//! (snake_case). Only top-level fields are renamed; nested values are carried
//! through untouched.
//!
//! `FIELD_MAP` must list every field of every record type. Names missing from
//! it fall back to a mechanical case conversion and are logged at debug level;
//! a field whose converted column would read back under a different name
//! (`a_b`, `ABc`, `recordFamilyId`) is rejected instead of silently renamed.
//!
//! A record's own `familyId` is stored as `record_family_id`, since the
//! `family_id` column scopes rows to the signed-in family.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{KinError, Result};

pub const FIELD_MAP: &[(&str, &str)] = &[
    // shared
    ("id", "id"),
    ("userId", "user_id"),
    ("familyId", "record_family_id"),
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("createdBy", "created_by"),
    ("notes", "notes"),
    // ledger entries
    ("type", "type"),
    ("amount", "amount"),
    ("category", "category"),
    ("description", "description"),
    ("date", "date"),
    ("timeDurationMinutes", "time_duration_minutes"),
    ("receiptUrl", "receipt_url"),
    ("isRecurring", "is_recurring"),
    ("recurringExpenseId", "recurring_expense_id"),
    // tasks and help tasks
    ("title", "title"),
    ("assignedTo", "assigned_to"),
    ("dueDate", "due_date"),
    ("isCompleted", "is_completed"),
    ("completedAt", "completed_at"),
    ("priority", "priority"),
    ("requestedBy", "requested_by"),
    ("claimedBy", "claimed_by"),
    ("claimedAt", "claimed_at"),
    // documents
    ("name", "name"),
    ("fileType", "file_type"),
    ("fileSize", "file_size"),
    ("url", "url"),
    ("tags", "tags"),
    ("uploadedBy", "uploaded_by"),
    ("uploadedAt", "uploaded_at"),
    // medications and their logs
    ("dosage", "dosage"),
    ("frequency", "frequency"),
    ("timesOfDay", "times_of_day"),
    ("startDate", "start_date"),
    ("endDate", "end_date"),
    ("prescribedBy", "prescribed_by"),
    ("isActive", "is_active"),
    ("medicationId", "medication_id"),
    ("takenAt", "taken_at"),
    ("takenBy", "taken_by"),
    ("skipped", "skipped"),
    // recurring expenses
    ("intervalDays", "interval_days"),
    ("nextDueDate", "next_due_date"),
    ("lastGeneratedAt", "last_generated_at"),
    // family invites
    ("email", "email"),
    ("role", "role"),
    ("status", "status"),
    ("invitedBy", "invited_by"),
    ("invitedAt", "invited_at"),
    ("acceptedAt", "accepted_at"),
    ("expiresAt", "expires_at"),
    ("token", "token"),
    // settings
    ("familyName", "family_name"),
    ("careRecipientName", "care_recipient_name"),
    ("currency", "currency"),
    ("hourlyRate", "hourly_rate"),
    ("reminderLeadMinutes", "reminder_lead_minutes"),
    ("theme", "theme"),
    ("language", "language"),
    // security events
    ("timestamp", "timestamp"),
    ("details", "details"),
    ("severity", "severity"),
    ("user", "user"),
];

pub fn to_column(field: &str) -> Result<String> {
    if let Some((_, snake)) = FIELD_MAP.iter().find(|(camel, _)| *camel == field) {
        return Ok((*snake).to_string());
    }
    debug!(field, "unmapped record field, converting mechanically");
    let column = camel_to_snake(field);
    let back = to_field(&column);
    if back != field {
        warn!(field, %column, %back, "record field does not survive a remote round trip");
        return Err(KinError::StorageBackend(format!(
            "field {field:?} would be stored as {column:?} and read back as {back:?}"
        )));
    }
    Ok(column)
}

pub fn to_field(column: &str) -> String {
    match FIELD_MAP.iter().find(|(_, snake)| *snake == column) {
        Some((camel, _)) => (*camel).to_string(),
        None => {
            debug!(column, "unmapped row column, converting mechanically");
            snake_to_camel(column)
        }
    }
}

pub fn record_to_row(record: &Map<String, Value>) -> Result<Map<String, Value>> {
    record
        .iter()
        .map(|(k, v)| Ok((to_column(k)?, v.clone())))
        .collect()
}

pub fn row_to_record(row: &Map<String, Value>) -> Map<String, Value> {
    row.iter().map(|(k, v)| (to_field(k), v.clone())).collect()
}

fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn snake_to_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper = false;
    for ch in s.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn table_is_a_bijection() {
        let camels: HashSet<_> = FIELD_MAP.iter().map(|(c, _)| c).collect();
        let snakes: HashSet<_> = FIELD_MAP.iter().map(|(_, s)| s).collect();
        assert_eq!(camels.len(), FIELD_MAP.len());
        assert_eq!(snakes.len(), FIELD_MAP.len());
        for (camel, snake) in FIELD_MAP {
            assert_eq!(to_field(&to_column(camel).unwrap()), *camel);
            if *camel != "familyId" {
                assert_eq!(camel_to_snake(camel), *snake, "table disagrees for {camel}");
            }
        }
    }

    #[test]
    fn own_family_id_stays_clear_of_the_scope_column() {
        assert_eq!(to_column("familyId").unwrap(), "record_family_id");
        assert_eq!(to_field("record_family_id"), "familyId");
    }

    #[test]
    fn fields_that_would_be_renamed_are_rejected() {
        assert!(to_column("a_b").is_err());
        assert!(to_column("ABc").is_err());
        assert!(to_column("recordFamilyId").is_err());
        assert_eq!(to_column("someNewField").unwrap(), "some_new_field");

        let record = json!({"id": "x", "snake_case_field": 1});
        assert!(record_to_row(record.as_object().unwrap()).is_err());
    }

    #[test]
    fn rows_roundtrip() {
        let record = json!({
            "id": "e1",
            "userId": "u1",
            "timeDurationMinutes": 45,
            "meta": {"nestedKey": 1},
            "someNewField": true
        });
        let row = record_to_row(record.as_object().unwrap()).unwrap();
        assert_eq!(row["user_id"], json!("u1"));
        assert_eq!(row["time_duration_minutes"], json!(45));
        assert_eq!(row["meta"], json!({"nestedKey": 1}));
        assert_eq!(row["some_new_field"], json!(true));
        assert_eq!(Value::Object(row_to_record(&row)), record);
    }
}
