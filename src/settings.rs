use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::orchestrator::RegionalPolicy;
use crate::webauthn::RelyingPartySettings;

/// Directory holding an overriding `Settings.toml`
pub const CONFIG_DIR_ENV: &str = "PASSKEY_CORE_CONFIG_DIR";
const SETTINGS_FILE: &str = "Settings.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings file: {0}")]
    Parse(#[from] basic_toml::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CoreSettings {
    pub relying_party: RelyingPartySettings,
    pub challenge: ChallengeSettings,
    pub registration: RegistrationSettings,
    pub risk: RiskSettings,
    pub audit: AuditSettings,
    pub logging: LoggingSettings,
    /// Policy for requests without a region or with an unlisted region
    pub default_policy: RegionalPolicy,
    /// Per-region policy, keyed by region code
    pub regions: HashMap<String, RegionalPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChallengeSettings {
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistrationSettings {
    pub max_credentials_per_user: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskSettings {
    /// Scores above this are classified high risk
    pub high_risk_threshold: f64,
    /// ISO 3166 alpha-2 codes
    pub high_risk_countries: Vec<String>,
    /// Authenticator model IDs (AAGUIDs) known to be compromised
    pub denylisted_models: Vec<String>,
    pub impossible_distance_km: f64,
    pub dormancy_days: i64,
    pub minimum_browser_versions: BTreeMap<String, u32>,
    pub minimum_os_versions: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditSettings {
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            max_credentials_per_user: 10,
        }
    }
}

impl Default for RiskSettings {
    fn default() -> Self {
        let versions = |pairs: &[(&str, u32)]| {
            pairs
                .iter()
                .map(|(name, major)| ((*name).to_string(), *major))
                .collect()
        };
        Self {
            high_risk_threshold: 0.7,
            high_risk_countries: Vec::new(),
            denylisted_models: Vec::new(),
            impossible_distance_km: 1000.0,
            dormancy_days: 90,
            minimum_browser_versions: versions(&[
                ("Chrome", 100),
                ("Edge", 100),
                ("Firefox", 100),
                ("Opera", 85),
                ("Safari", 15),
            ]),
            minimum_os_versions: versions(&[("Android", 10), ("iOS", 15), ("Windows", 10)]),
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CoreSettings {
    /// Load settings from configuration files and environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Settings file cannot be read or parsed
    /// - The resulting settings fail validation
    pub fn load() -> Result<Self, SettingsError> {
        Self::initialize_logging();

        let mut settings = Self::load_base_settings()?;
        Self::apply_env_overrides(&mut settings);
        settings.validate()?;

        Ok(settings)
    }

    /// Initialize `env_logger`; a logger installed by the host wins
    fn initialize_logging() {
        if env_logger::try_init().is_err() {
            log::debug!("Logger already initialized");
        }
    }

    /// Load base settings from TOML file(s) or use defaults
    /// Settings are loaded with the following priority (highest to lowest):
    /// 1. Environment variables (applied separately after loading base settings)
    /// 2. Settings.toml in `PASSKEY_CORE_CONFIG_DIR` (if specified and exists)
    /// 3. Settings.toml in current directory (if exists)
    /// 4. Default settings
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file cannot be read or parsed
    fn load_base_settings() -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        let default_config_path = Path::new(SETTINGS_FILE);
        if default_config_path.exists() {
            settings = Self::from_file(default_config_path)?;
            log::info!("Loaded base settings from {}", default_config_path.display());
        }

        if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV) {
            let override_path = Path::new(&config_dir).join(SETTINGS_FILE);
            if override_path.exists() {
                settings = Self::from_file(&override_path)?;
                log::info!("Overriding settings from {}", override_path.display());
            } else {
                log::info!(
                    "{CONFIG_DIR_ENV} set but no {SETTINGS_FILE} found at: {}",
                    override_path.display()
                );
            }
        }

        Ok(settings)
    }

    /// Parse a single TOML settings file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let toml_content = fs::read_to_string(path)?;
        Ok(basic_toml::from_str(&toml_content)?)
    }

    /// Apply environment variable overrides to settings
    fn apply_env_overrides(settings: &mut Self) {
        if let Ok(rp_id) = std::env::var("RP_ID") {
            settings.relying_party.rp_id = rp_id;
        }
        if let Ok(rp_name) = std::env::var("RP_NAME") {
            settings.relying_party.rp_name = rp_name;
        }
        if let Ok(origins) = std::env::var("RP_ORIGINS") {
            settings.relying_party.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Self::apply_parsed_env_override("CHALLENGE_TTL_SECONDS", &mut settings.challenge.ttl_seconds);
        Self::apply_parsed_env_override(
            "MAX_CREDENTIALS_PER_USER",
            &mut settings.registration.max_credentials_per_user,
        );
        Self::apply_parsed_env_override("HIGH_RISK_THRESHOLD", &mut settings.risk.high_risk_threshold);
        Self::apply_parsed_env_override("AUDIT_QUEUE_CAPACITY", &mut settings.audit.queue_capacity);
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            settings.logging.level = log_level;
        }
    }

    /// Helper function to apply a parsed environment variable override
    fn apply_parsed_env_override<T: std::str::FromStr>(env_var: &str, target: &mut T) {
        if let Ok(value_str) = std::env::var(env_var) {
            match value_str.parse::<T>() {
                Ok(value) => *target = value,
                Err(_) => log::warn!("Ignoring unparsable {env_var}={value_str}"),
            }
        }
    }

    /// Check the settings can drive the core
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Invalid` describing the first problem found
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.relying_party.validate().map_err(SettingsError::Invalid)?;
        if self.challenge.ttl_seconds == 0 {
            return Err(SettingsError::Invalid("challenge ttl must be positive".into()));
        }
        if self.registration.max_credentials_per_user == 0 {
            return Err(SettingsError::Invalid(
                "max_credentials_per_user must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.high_risk_threshold) {
            return Err(SettingsError::Invalid(
                "high_risk_threshold must be within [0, 1]".into(),
            ));
        }
        if self.audit.queue_capacity == 0 {
            return Err(SettingsError::Invalid("audit queue capacity must be positive".into()));
        }
        Ok(())
    }

    /// Challenge lifetime
    #[must_use]
    pub fn challenge_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.challenge.ttl_seconds).unwrap_or(i64::MAX / 1000))
    }

    /// Policy configured for a region, falling back to the default policy
    #[must_use]
    pub fn policy_for(&self, region: Option<&str>) -> RegionalPolicy {
        region
            .and_then(|r| self.regions.get(r))
            .copied()
            .unwrap_or(self.default_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    // Helper function to clean all relevant environment variables for tests
    fn clean_env_vars() {
        for var in [
            "RP_ID",
            "RP_NAME",
            "RP_ORIGINS",
            "CHALLENGE_TTL_SECONDS",
            "MAX_CREDENTIALS_PER_USER",
            "HIGH_RISK_THRESHOLD",
            "AUDIT_QUEUE_CAPACITY",
            CONFIG_DIR_ENV,
        ] {
            std::env::remove_var(var);
        }
    }

    fn write_settings(dir: &Path, contents: &str) {
        let mut file = fs::File::create(dir.join(SETTINGS_FILE)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn test_defaults() {
        let settings = CoreSettings::default();
        assert_eq!(settings.challenge.ttl_seconds, 300);
        assert_eq!(settings.registration.max_credentials_per_user, 10);
        assert!((settings.risk.high_risk_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(settings.challenge_ttl(), chrono::Duration::seconds(300));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: CoreSettings = basic_toml::from_str(
            r#"
            [relying_party]
            rp_id = "example.com"
            rp_name = "Example"
            allowed_origins = ["https://example.com"]

            [regions.eu]
            require_user_verification = true
            require_attestation = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.relying_party.rp_id, "example.com");
        assert_eq!(settings.relying_party.timeout_seconds, 60);
        assert_eq!(settings.registration.max_credentials_per_user, 10);
        assert!(settings.policy_for(Some("eu")).require_attestation);
        assert!(!settings.policy_for(Some("us")).require_attestation);
        assert!(!settings.policy_for(None).require_user_verification);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clean_env_vars();
        std::env::set_var("RP_ID", "login.example.com");
        std::env::set_var("RP_ORIGINS", "https://login.example.com, https://app.example.com");
        std::env::set_var("MAX_CREDENTIALS_PER_USER", "3");
        std::env::set_var("HIGH_RISK_THRESHOLD", "not-a-number");

        let mut settings = CoreSettings::default();
        CoreSettings::apply_env_overrides(&mut settings);

        assert_eq!(settings.relying_party.rp_id, "login.example.com");
        assert_eq!(
            settings.relying_party.allowed_origins,
            vec!["https://login.example.com", "https://app.example.com"]
        );
        assert_eq!(settings.registration.max_credentials_per_user, 3);
        // Unparsable values leave the setting unchanged
        assert!((settings.risk.high_risk_threshold - 0.7).abs() < f64::EPSILON);

        clean_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_dir_takes_precedence() {
        clean_env_vars();
        let dir = tempfile::tempdir().unwrap();
        write_settings(
            dir.path(),
            r#"
            [registration]
            max_credentials_per_user = 4

            [challenge]
            ttl_seconds = 120
            "#,
        );
        std::env::set_var(CONFIG_DIR_ENV, dir.path());
        std::env::set_var("CHALLENGE_TTL_SECONDS", "90");

        let settings = CoreSettings::load().unwrap();
        assert_eq!(settings.registration.max_credentials_per_user, 4);
        // Environment beats the file
        assert_eq!(settings.challenge.ttl_seconds, 90);

        clean_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_settings_rejected() {
        clean_env_vars();
        let dir = tempfile::tempdir().unwrap();
        write_settings(
            dir.path(),
            r#"
            [relying_party]
            rp_id = "example.com"
            allowed_origins = ["http://example.com"]
            "#,
        );
        std::env::set_var(CONFIG_DIR_ENV, dir.path());

        assert!(matches!(CoreSettings::load(), Err(SettingsError::Invalid(_))));

        clean_env_vars();
    }

    #[test]
    fn test_validate_bounds() {
        let mut settings = CoreSettings::default();
        settings.registration.max_credentials_per_user = 0;
        assert!(settings.validate().is_err());

        let mut settings = CoreSettings::default();
        settings.risk.high_risk_threshold = 1.5;
        assert!(settings.validate().is_err());
    }
}
