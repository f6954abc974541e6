use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Caregiver,
    Viewer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    ManageSecurity,
    ExportBackup,
    ImportBackup,
    ResetData,
    WriteRecords,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::ManageSecurity => "manage security",
            Capability::ExportBackup => "export backups",
            Capability::ImportBackup => "import backups",
            Capability::ResetData => "reset data",
            Capability::WriteRecords => "write records",
        };
        f.write_str(s)
    }
}

impl Role {
    pub fn allows(self, capability: Capability) -> bool {
        match self {
            Role::Admin => true,
            Role::Caregiver => matches!(
                capability,
                Capability::ExportBackup | Capability::WriteRecords
            ),
            Role::Viewer => false,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "caregiver" => Ok(Role::Caregiver),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// The family member on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self::new(name, Role::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_matrix() {
        use Capability::*;
        let all = [ManageSecurity, ExportBackup, ImportBackup, ResetData, WriteRecords];
        assert!(all.iter().all(|c| Role::Admin.allows(*c)));
        assert!(all.iter().all(|c| !Role::Viewer.allows(*c)));
        assert!(Role::Caregiver.allows(ExportBackup));
        assert!(Role::Caregiver.allows(WriteRecords));
        assert!(!Role::Caregiver.allows(ImportBackup));
        assert!(!Role::Caregiver.allows(ManageSecurity));
        assert!(!Role::Caregiver.allows(ResetData));
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Caregiver".parse::<Role>(), Ok(Role::Caregiver));
        assert_eq!(" viewer ".parse::<Role>(), Ok(Role::Viewer));
        assert!("owner".parse::<Role>().is_err());
    }
}
