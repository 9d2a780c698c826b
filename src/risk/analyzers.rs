//! Risk signal analyzers
//!
//! Each analyzer looks at one aspect of a request and emits zero or more
//! factors. Analyzers are independent of each other and run concurrently.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Timelike};

use super::context::{RiskContext, RiskOperation, RiskSignals};
use super::factor::{RiskError, RiskFactor, RiskFactorType};
use super::user_agent::{parse_user_agent, ClientVersion};
use crate::settings::RiskSettings;
use crate::store::SecurityTier;

/// Number of frequent addresses considered familiar
pub const FAMILIAR_ADDRESS_COUNT: usize = 10;

#[async_trait]
pub trait RiskAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(
        &self,
        context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError>;
}

/// The standard analyzer set
#[must_use]
pub fn default_analyzers(settings: &RiskSettings) -> Vec<Arc<dyn RiskAnalyzer>> {
    vec![
        Arc::new(GeographicAnalyzer::new(settings)),
        Arc::new(DeviceAnalyzer::new(settings)),
        Arc::new(BehavioralAnalyzer),
        Arc::new(AuthenticatorAnalyzer::new(settings)),
        Arc::new(UsagePatternAnalyzer::new(settings)),
        Arc::new(VelocityAnalyzer),
        Arc::new(VerificationAnalyzer),
    ]
}

#[allow(clippy::cast_precision_loss)]
fn ratio(count: usize, scale: f64) -> f64 {
    (count as f64 / scale).min(1.0)
}

/// Denylisted countries, travel distance and anonymising proxies
#[derive(Debug, Clone)]
pub struct GeographicAnalyzer {
    high_risk_countries: HashSet<String>,
    impossible_distance_km: f64,
}

impl GeographicAnalyzer {
    #[must_use]
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            high_risk_countries: settings
                .high_risk_countries
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            impossible_distance_km: settings.impossible_distance_km,
        }
    }
}

#[async_trait]
impl RiskAnalyzer for GeographicAnalyzer {
    fn name(&self) -> &'static str {
        "geographic"
    }

    async fn analyze(
        &self,
        context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        let mut factors = Vec::new();

        if let Some(country) = &context.country_code {
            if self.high_risk_countries.contains(&country.to_ascii_uppercase()) {
                factors.push(RiskFactor::negative(
                    RiskFactorType::GeographicHighRiskCountry,
                    0.3,
                    1.0,
                )?);
            }
        }

        if let (Some(here), Some(usual)) = (context.location, signals.habitual_location) {
            let distance = here.distance_km(&usual);
            if distance > self.impossible_distance_km {
                factors.push(RiskFactor::negative(
                    RiskFactorType::GeographicImpossibleDistance,
                    0.25,
                    (distance / 10_000.0).min(1.0),
                )?);
            }
        }

        if context.proxy_detected {
            factors.push(RiskFactor::negative(
                RiskFactorType::GeographicProxyDetected,
                0.2,
                0.8,
            )?);
        }

        Ok(factors)
    }
}

/// Device familiarity and client freshness
#[derive(Debug, Clone)]
pub struct DeviceAnalyzer {
    minimum_browser_versions: BTreeMap<String, u32>,
    minimum_os_versions: BTreeMap<String, u32>,
}

impl DeviceAnalyzer {
    #[must_use]
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            minimum_browser_versions: settings.minimum_browser_versions.clone(),
            minimum_os_versions: settings.minimum_os_versions.clone(),
        }
    }

    fn below_minimum(version: Option<&ClientVersion>, minimums: &BTreeMap<String, u32>) -> bool {
        version.is_some_and(|v| minimums.get(v.name).is_some_and(|min| v.major < *min))
    }

    fn is_outdated(&self, user_agent: &str) -> bool {
        let info = parse_user_agent(user_agent);
        Self::below_minimum(info.browser.as_ref(), &self.minimum_browser_versions)
            || Self::below_minimum(info.os.as_ref(), &self.minimum_os_versions)
    }
}

#[async_trait]
impl RiskAnalyzer for DeviceAnalyzer {
    fn name(&self) -> &'static str {
        "device"
    }

    async fn analyze(
        &self,
        context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        let mut factors = Vec::new();

        let known = context
            .device_fingerprint
            .as_ref()
            .is_some_and(|fp| signals.known_devices.iter().any(|d| d == fp));
        if !known {
            factors.push(RiskFactor::negative(RiskFactorType::DeviceUnknown, 0.2, 0.6)?);
        }

        if context
            .user_agent
            .as_deref()
            .is_some_and(|ua| self.is_outdated(ua))
        {
            factors.push(RiskFactor::negative(
                RiskFactorType::DeviceOutdatedClient,
                0.1,
                0.5,
            )?);
        }

        if context.authenticator.backup_eligible {
            factors.push(RiskFactor::negative(
                RiskFactorType::DeviceMultiDeviceAuthenticator,
                0.05,
                0.3,
            )?);
        }

        Ok(factors)
    }
}

/// Time of day, attempt bursts and ceremony duration
#[derive(Debug, Clone, Copy)]
pub struct BehavioralAnalyzer;

#[async_trait]
impl RiskAnalyzer for BehavioralAnalyzer {
    fn name(&self) -> &'static str {
        "behavioral"
    }

    async fn analyze(
        &self,
        context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        let mut factors = Vec::new();

        if !(6..=23).contains(&context.at.hour()) {
            factors.push(RiskFactor::negative(
                RiskFactorType::BehavioralUnusualHour,
                0.1,
                0.5,
            )?);
        }

        if signals.attempts_last_five_minutes > 5 {
            factors.push(RiskFactor::negative(
                RiskFactorType::BehavioralRapidAttempts,
                0.25,
                ratio(signals.attempts_last_five_minutes, 10.0),
            )?);
        }

        if context
            .session_duration
            .is_some_and(|d| d < Duration::seconds(10))
        {
            factors.push(RiskFactor::negative(
                RiskFactorType::BehavioralShortSession,
                0.1,
                0.4,
            )?);
        }

        Ok(factors)
    }
}

/// Authenticator model reputation and verification strength
#[derive(Debug, Clone)]
pub struct AuthenticatorAnalyzer {
    denylisted_models: HashSet<String>,
}

impl AuthenticatorAnalyzer {
    #[must_use]
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            denylisted_models: settings
                .denylisted_models
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl RiskAnalyzer for AuthenticatorAnalyzer {
    fn name(&self) -> &'static str {
        "authenticator"
    }

    async fn analyze(
        &self,
        context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        let mut factors = Vec::new();

        if context
            .authenticator
            .model_id
            .as_ref()
            .is_some_and(|m| self.denylisted_models.contains(&m.to_ascii_lowercase()))
        {
            factors.push(RiskFactor::negative(
                RiskFactorType::AuthenticatorDenylistedModel,
                0.4,
                1.0,
            )?);
        }

        if signals.security_tier == Some(SecurityTier::Low) {
            factors.push(RiskFactor::negative(
                RiskFactorType::AuthenticatorLowSecurityTier,
                0.15,
                0.6,
            )?);
        }

        if !context.authenticator.user_verified {
            factors.push(RiskFactor::negative(
                RiskFactorType::AuthenticatorMissingUserVerification,
                0.15,
                0.7,
            )?);
        }

        Ok(factors)
    }
}

/// Credential dormancy and address familiarity
#[derive(Debug, Clone)]
pub struct UsagePatternAnalyzer {
    dormancy_days: i64,
}

impl UsagePatternAnalyzer {
    #[must_use]
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            dormancy_days: settings.dormancy_days,
        }
    }
}

#[async_trait]
impl RiskAnalyzer for UsagePatternAnalyzer {
    fn name(&self) -> &'static str {
        "usage_pattern"
    }

    async fn analyze(
        &self,
        context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        let mut factors = Vec::new();

        if context.operation == RiskOperation::Authentication {
            if let Some(last_used) = context.authenticator.last_used_at {
                let idle_days = (context.at - last_used).num_days();
                if idle_days > self.dormancy_days {
                    #[allow(clippy::cast_precision_loss)]
                    let value = (idle_days as f64 / 365.0).min(1.0);
                    factors.push(RiskFactor::negative(
                        RiskFactorType::UsageDormantCredential,
                        0.15,
                        value,
                    )?);
                }
            }
        }

        if let Some(ip) = &context.ip {
            let familiar = signals
                .frequent_addresses
                .iter()
                .take(FAMILIAR_ADDRESS_COUNT)
                .any(|a| a == ip);
            if !familiar {
                factors.push(RiskFactor::negative(
                    RiskFactorType::UsageUnfamiliarAddress,
                    0.1,
                    0.4,
                )?);
            }
        }

        Ok(factors)
    }
}

/// Attempt rate per minute and per hour
#[derive(Debug, Clone, Copy)]
pub struct VelocityAnalyzer;

#[async_trait]
impl RiskAnalyzer for VelocityAnalyzer {
    fn name(&self) -> &'static str {
        "velocity"
    }

    async fn analyze(
        &self,
        _context: &RiskContext,
        signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        let mut factors = Vec::new();

        if signals.attempts_last_minute > 10 {
            factors.push(RiskFactor::negative(
                RiskFactorType::VelocityPerMinute,
                0.2,
                ratio(signals.attempts_last_minute, 20.0),
            )?);
        }
        if signals.attempts_last_hour > 50 {
            factors.push(RiskFactor::negative(
                RiskFactorType::VelocityPerHour,
                0.15,
                ratio(signals.attempts_last_hour, 100.0),
            )?);
        }

        Ok(factors)
    }
}

/// Credit for a user-verified ceremony
#[derive(Debug, Clone, Copy)]
pub struct VerificationAnalyzer;

#[async_trait]
impl RiskAnalyzer for VerificationAnalyzer {
    fn name(&self) -> &'static str {
        "verification"
    }

    async fn analyze(
        &self,
        context: &RiskContext,
        _signals: &RiskSignals,
    ) -> Result<Vec<RiskFactor>, RiskError> {
        if context.authenticator.user_verified {
            Ok(vec![RiskFactor::positive(
                RiskFactorType::UserVerificationPerformed,
                0.1,
                0.3,
            )?])
        } else {
            Ok(Vec::new())
        }
    }
}
