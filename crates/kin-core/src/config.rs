use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::error::{KinError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "kin";
pub const APP_NAME: &str = "caregiving";

pub const ENV_PROVIDER: &str = "KIN_STORAGE_PROVIDER";
pub const ENV_SUPABASE_URL: &str = "SUPABASE_URL";
pub const ENV_SUPABASE_KEY: &str = "SUPABASE_ANON_KEY";
pub const ENV_FAMILY_ID: &str = "KIN_FAMILY_ID";
pub const ENV_DATA_DIR: &str = "KIN_DATA_DIR";

pub const DEFAULT_FAMILY_ID: &str = "default";

/// Provider selection as requested by a caller or the environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    Local,
    Supabase,
    Auto,
}

impl FromStr for ProviderChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "supabase" => Ok(Self::Supabase),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown storage provider {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct KinConfig {
    pub provider: Option<ProviderChoice>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub family_id: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl KinConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let provider = lookup(ENV_PROVIDER).and_then(|raw| match raw.parse() {
            Ok(choice) => Some(choice),
            Err(err) => {
                warn!(%err, "ignoring {ENV_PROVIDER}");
                None
            }
        });
        Self {
            provider,
            supabase_url: lookup(ENV_SUPABASE_URL),
            supabase_key: lookup(ENV_SUPABASE_KEY),
            family_id: lookup(ENV_FAMILY_ID),
            data_dir: lookup(ENV_DATA_DIR).map(PathBuf::from),
        }
    }

    pub fn remote_credentials(&self) -> Option<RemoteCredentials> {
        let url = self.supabase_url.as_deref().map(str::trim).unwrap_or("");
        let key = self.supabase_key.as_deref().map(str::trim).unwrap_or("");
        if url.is_empty() || key.is_empty() {
            return None;
        }
        Some(RemoteCredentials {
            url: url.trim_end_matches('/').to_string(),
            api_key: key.to_string(),
        })
    }

    pub fn family_id(&self) -> String {
        self.family_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_FAMILY_ID)
            .to_string()
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
            KinError::StorageBackend("cannot determine data directory".to_string())
        })?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> KinConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        KinConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn parses_provider_and_ignores_garbage() {
        assert_eq!(
            config(&[(ENV_PROVIDER, " Supabase ")]).provider,
            Some(ProviderChoice::Supabase)
        );
        assert_eq!(config(&[(ENV_PROVIDER, "redis")]).provider, None);
    }

    #[test]
    fn credentials_need_both_halves() {
        assert!(config(&[(ENV_SUPABASE_URL, "https://x.supabase.co")])
            .remote_credentials()
            .is_none());
        assert!(config(&[(ENV_SUPABASE_URL, "https://x"), (ENV_SUPABASE_KEY, "  ")])
            .remote_credentials()
            .is_none());
        let creds = config(&[
            (ENV_SUPABASE_URL, "https://x.supabase.co/"),
            (ENV_SUPABASE_KEY, "anon"),
        ])
        .remote_credentials()
        .unwrap();
        assert_eq!(creds.url, "https://x.supabase.co");
    }

    #[test]
    fn family_id_defaults() {
        assert_eq!(config(&[]).family_id(), DEFAULT_FAMILY_ID);
        assert_eq!(config(&[(ENV_FAMILY_ID, "fam-7")]).family_id(), "fam-7");
    }
}
