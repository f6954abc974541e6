//! Stable storage key namespace and its remote collection mapping.

pub const ENTRIES: &str = "kin_entries";
pub const TASKS: &str = "kin_tasks";
pub const DOCUMENTS: &str = "kin_documents";
pub const SETTINGS: &str = "kin_settings";
pub const SECURITY_LOGS: &str = "kin_security_logs";
pub const RECURRING_EXPENSES: &str = "kin_recurring_expenses";
pub const FAMILY_INVITES: &str = "kin_family_invites";
pub const HELP_TASKS: &str = "kin_help_tasks";
pub const MEDICATIONS: &str = "kin_medications";
pub const MEDICATION_LOGS: &str = "kin_medication_logs";

/// Plaintext record holding the salt and PIN hash. Lives beside the data but
/// outside the namespace, and is never encrypted.
pub const SECURITY_METADATA: &str = "kin_security_meta";

pub const ALL: [&str; 10] = [
    ENTRIES,
    TASKS,
    DOCUMENTS,
    SETTINGS,
    SECURITY_LOGS,
    RECURRING_EXPENSES,
    FAMILY_INVITES,
    HELP_TASKS,
    MEDICATIONS,
    MEDICATION_LOGS,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    /// One record per family.
    Singleton,
    /// One row per array element, keyed by `id`.
    Collection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCollection {
    pub table: &'static str,
    pub shape: KeyShape,
}

pub fn remote_collection(key: &str) -> Option<RemoteCollection> {
    let (table, shape) = match key {
        ENTRIES => ("entries", KeyShape::Collection),
        TASKS => ("tasks", KeyShape::Collection),
        DOCUMENTS => ("documents", KeyShape::Collection),
        SETTINGS => ("settings", KeyShape::Singleton),
        SECURITY_LOGS => ("security_logs", KeyShape::Collection),
        RECURRING_EXPENSES => ("recurring_expenses", KeyShape::Collection),
        FAMILY_INVITES => ("family_invites", KeyShape::Collection),
        HELP_TASKS => ("help_tasks", KeyShape::Collection),
        MEDICATIONS => ("medications", KeyShape::Collection),
        MEDICATION_LOGS => ("medication_logs", KeyShape::Collection),
        _ => return None,
    };
    Some(RemoteCollection { table, shape })
}
