//! # dnsgate Configuration System
//!
//! Hierarchical configuration for the dnsgate policy engine.
//!
//! ## Features
//! - **Unified Configuration**: engine tunables and per-profile allow-lists
//!   in one document
//! - **Validation at load time**: malformed domain patterns and CIDR ranges
//!   are rejected before any VM can be armed, never deferred to match time
//! - **Environment Awareness**: `DNSGATE_*` variables override file values

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod engine;
mod error;
mod policy;
mod validation;

pub use engine::{EngineConfig, RetryConfig};
pub use error::ConfigError;
pub use policy::{DomainPattern, PolicyStore, ProfileConfig, VmPolicy};

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default)]
pub struct DnsgateConfig {
    /// Policy engine parameters (sweep, queues, backend timeouts, retry).
    #[validate(nested)]
    pub engine: EngineConfig,

    /// Allow-list documents, one per VM profile.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

impl DnsgateConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/dnsgate.yaml` - base settings. If missing, defaults are used.
    /// 3. `config/<environment>.yaml` - environment-specific overrides.
    /// 4. `DNSGATE_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(DnsgateConfig::default()));

        if Path::new("config/dnsgate.yaml").exists() {
            figment = figment.merge(Yaml::file("config/dnsgate.yaml"));
        }

        let env = std::env::var("DNSGATE_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        figment
            .merge(Env::prefixed("DNSGATE_").split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                config.check_profiles()?;
                Ok(config)
            })
    }

    /// Load configuration from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(
                path.to_string_lossy().to_string(),
            )));
        }

        Figment::from(Serialized::defaults(DnsgateConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("DNSGATE_").split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                config.check_profiles()?;
                Ok(config)
            })
    }

    /// Compiles every profile, surfacing the first malformed allow-list entry.
    fn check_profiles(&self) -> Result<(), ConfigError> {
        for (name, profile) in &self.profiles {
            profile
                .compile()
                .map_err(|e| e.in_profile(name.as_str()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_validation() {
        let config = DnsgateConfig::default();
        config.validate().expect("Default config should validate");
    }

    #[test]
    fn yaml_document_parses() {
        let figment = Figment::from(Serialized::defaults(DnsgateConfig::default())).merge(
            Yaml::string(
                r#"
engine:
  sweep_interval_secs: 2
profiles:
  office:
    domains: ["example.com", "smb.local"]
    networks: ["192.168.10.0/24"]
"#,
            ),
        );
        let config: DnsgateConfig = figment.extract().unwrap();
        config.validate().unwrap();
        config.check_profiles().unwrap();
        assert_eq!(config.engine.sweep_interval_secs, 2);
        assert_eq!(config.profiles["office"].domains.len(), 2);
    }

    #[test]
    fn malformed_pattern_is_a_load_error() {
        let figment = Figment::from(Serialized::defaults(DnsgateConfig::default())).merge(
            Yaml::string(
                r#"
profiles:
  bad:
    domains: ["..not-a-domain.."]
"#,
            ),
        );
        let config: DnsgateConfig = figment.extract().unwrap();
        assert!(matches!(
            config.check_profiles(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }
}
