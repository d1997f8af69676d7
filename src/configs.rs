use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PkiError;
use crate::keygen::MIN_RSA_KEY_SIZE;
use crate::storage::ROOT_CA_DIR_NAME;

/// Run configuration, read once and passed explicitly to every component.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default = "default_root_key_size")]
    pub root_key_size: u32,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    #[serde(default = "default_root_validity_days")]
    pub root_validity_days: u32,
    #[serde(default = "default_expiry_threshold_days")]
    pub expiry_threshold_days: u32,
    #[serde(default = "default_reissue_on_root_rotation")]
    pub reissue_on_root_rotation: bool,
    #[serde(default)]
    pub root_ca: RootCADefaults,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            certs_dir: default_certs_dir(),
            devices: default_devices(),
            broker: default_broker(),
            key_size: default_key_size(),
            root_key_size: default_root_key_size(),
            validity_days: default_validity_days(),
            root_validity_days: default_root_validity_days(),
            expiry_threshold_days: default_expiry_threshold_days(),
            reissue_on_root_rotation: default_reissue_on_root_rotation(),
            root_ca: RootCADefaults::default(),
        }
    }
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_devices() -> Vec<String> {
    vec!["device001".to_string(), "device002".to_string()]
}

fn default_broker() -> String {
    "mosquitto".to_string()
}

fn default_key_size() -> u32 {
    2048
}

fn default_root_key_size() -> u32 {
    3072
}

fn default_validity_days() -> u32 {
    365
}

fn default_root_validity_days() -> u32 {
    3650 // 10 years
}

fn default_expiry_threshold_days() -> u32 {
    30
}

fn default_reissue_on_root_rotation() -> bool {
    true
}

/// Distinguished name of the self-signed authority.
#[derive(Debug, Deserialize, Clone)]
pub struct RootCADefaults {
    #[serde(default = "default_root_ca_cn")]
    pub common_name: String,
    #[serde(default = "default_root_ca_org")]
    pub organization: String,
    #[serde(default = "default_root_ca_country")]
    pub country: String,
}

impl Default for RootCADefaults {
    fn default() -> Self {
        Self {
            common_name: default_root_ca_cn(),
            organization: default_root_ca_org(),
            country: default_root_ca_country(),
        }
    }
}

fn default_root_ca_cn() -> String {
    "My Root CA".to_string()
}

fn default_root_ca_org() -> String {
    "My Root CA".to_string()
}

fn default_root_ca_country() -> String {
    "TW".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load from `path` when given, otherwise fall back to built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values that would produce weak keys or unusable directory layouts.
    pub fn validate(&self) -> std::result::Result<(), PkiError> {
        if self.key_size < MIN_RSA_KEY_SIZE || self.root_key_size < MIN_RSA_KEY_SIZE {
            return Err(PkiError::Config(format!(
                "key sizes must be at least {} bits (key_size={}, root_key_size={})",
                MIN_RSA_KEY_SIZE, self.key_size, self.root_key_size
            )));
        }
        if self.validity_days == 0 || self.root_validity_days == 0 {
            return Err(PkiError::Config(
                "validity periods must be at least one day".to_string(),
            ));
        }
        // A fresh certificate must not already fall inside the renewal window.
        if self.validity_days <= self.expiry_threshold_days
            || self.root_validity_days <= self.expiry_threshold_days
        {
            return Err(PkiError::Config(format!(
                "validity periods must exceed expiry_threshold_days={} (validity_days={}, root_validity_days={})",
                self.expiry_threshold_days, self.validity_days, self.root_validity_days
            )));
        }

        let mut seen = HashSet::new();
        for name in self.identity_names() {
            validate_identity_name(name)?;
            if !seen.insert(name) {
                return Err(PkiError::Config(format!("duplicate identity name '{}'", name)));
            }
        }
        Ok(())
    }

    /// Devices first, then the broker, in configuration order.
    pub fn identity_names(&self) -> impl Iterator<Item = &str> {
        self.devices
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.broker.as_str()))
    }
}

fn validate_identity_name(name: &str) -> std::result::Result<(), PkiError> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains(':')
        || name.chars().any(char::is_control)
    {
        return Err(PkiError::Config(format!("invalid identity name '{}'", name)));
    }
    if name == ROOT_CA_DIR_NAME {
        return Err(PkiError::Config(format!(
            "identity name '{}' is reserved for the authority",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.devices, vec!["device001", "device002"]);
        assert_eq!(config.broker, "mosquitto");
        assert_eq!(config.validity_days, 365);
        assert_eq!(config.root_validity_days, 3650);
        assert_eq!(config.expiry_threshold_days, 30);
        assert_eq!(config.root_ca.country, "TW");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config: AppConfig = toml::from_str(
            r#"
            devices = ["dev1"]
            broker = "broker"
            key_size = 4096

            [root_ca]
            common_name = "Fleet Root"
            "#,
        )
        .unwrap();
        assert_eq!(config.identity_names().collect::<Vec<_>>(), vec!["dev1", "broker"]);
        assert_eq!(config.key_size, 4096);
        assert_eq!(config.root_ca.common_name, "Fleet Root");
        assert_eq!(config.root_ca.organization, "My Root CA");
    }

    #[test]
    fn test_shipped_config_parses() {
        let config: AppConfig = toml::from_str(include_str!("../config.toml")).unwrap();
        assert_eq!(config.root_key_size, 3072);
        assert!(config.reissue_on_root_rotation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.key_size = 1024;
        assert!(matches!(config.validate(), Err(PkiError::Config(_))));

        let mut config = AppConfig::default();
        config.devices = vec!["dev1".into(), "dev1".into()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broker = "root_ca".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.devices = vec!["../etc".into()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.validity_days = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.devices = vec!["CA:TRUE".into()];
        assert!(matches!(config.validate(), Err(PkiError::Config(_))));

        let mut config = AppConfig::default();
        config.broker = "broker\nCA:TRUE".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validity_must_exceed_threshold() {
        let mut config = AppConfig::default();
        config.validity_days = 30;
        assert!(matches!(config.validate(), Err(PkiError::Config(_))));

        let mut config = AppConfig::default();
        config.root_validity_days = 20;
        assert!(matches!(config.validate(), Err(PkiError::Config(_))));

        let mut config = AppConfig::default();
        config.expiry_threshold_days = 365;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.validity_days = 31;
        assert!(config.validate().is_ok());
    }
}
