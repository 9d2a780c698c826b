//! Risk factors and score aggregation

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Score when no factor fired; never zero so a quiet request is not "safe"
pub const BASELINE_SCORE: f64 = 0.1;
/// Score substituted when the engine could not assess a request
pub const NEUTRAL_SCORE: f64 = 0.5;
pub const MIN_SCORE: f64 = 0.01;
pub const MAX_SCORE: f64 = 0.99;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("risk factor weight {0} is outside (0, 1]")]
    InvalidWeight(f64),

    #[error("risk factor value {0} is outside [0, 1]")]
    InvalidValue(f64),

    #[error("risk signals unavailable: {0}")]
    Signals(String),

    #[error("analyzer {analyzer} failed: {message}")]
    Analyzer {
        analyzer: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactorType {
    GeographicHighRiskCountry,
    GeographicImpossibleDistance,
    GeographicProxyDetected,
    DeviceUnknown,
    DeviceOutdatedClient,
    DeviceMultiDeviceAuthenticator,
    BehavioralUnusualHour,
    BehavioralRapidAttempts,
    BehavioralShortSession,
    AuthenticatorDenylistedModel,
    AuthenticatorLowSecurityTier,
    AuthenticatorMissingUserVerification,
    UsageDormantCredential,
    UsageUnfamiliarAddress,
    VelocityPerMinute,
    VelocityPerHour,
    UserVerificationPerformed,
}

impl RiskFactorType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RiskFactorType::GeographicHighRiskCountry => "geographic_high_risk_country",
            RiskFactorType::GeographicImpossibleDistance => "geographic_impossible_distance",
            RiskFactorType::GeographicProxyDetected => "geographic_proxy_detected",
            RiskFactorType::DeviceUnknown => "device_unknown",
            RiskFactorType::DeviceOutdatedClient => "device_outdated_client",
            RiskFactorType::DeviceMultiDeviceAuthenticator => "device_multi_device_authenticator",
            RiskFactorType::BehavioralUnusualHour => "behavioral_unusual_hour",
            RiskFactorType::BehavioralRapidAttempts => "behavioral_rapid_attempts",
            RiskFactorType::BehavioralShortSession => "behavioral_short_session",
            RiskFactorType::AuthenticatorDenylistedModel => "authenticator_denylisted_model",
            RiskFactorType::AuthenticatorLowSecurityTier => "authenticator_low_security_tier",
            RiskFactorType::AuthenticatorMissingUserVerification => {
                "authenticator_missing_user_verification"
            }
            RiskFactorType::UsageDormantCredential => "usage_dormant_credential",
            RiskFactorType::UsageUnfamiliarAddress => "usage_unfamiliar_address",
            RiskFactorType::VelocityPerMinute => "velocity_per_minute",
            RiskFactorType::VelocityPerHour => "velocity_per_hour",
            RiskFactorType::UserVerificationPerformed => "user_verification_performed",
        }
    }
}

impl fmt::Display for RiskFactorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a factor raises (negative) or lowers (positive) the risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

/// One weighted observation about a request
///
/// Fields are private so a factor can only exist with an in-range weight
/// and value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    factor_type: RiskFactorType,
    weight: f64,
    value: f64,
    polarity: Polarity,
}

impl RiskFactor {
    /// Build a factor
    ///
    /// # Errors
    /// Returns an error if `weight` is not in (0, 1] or `value` is not in [0, 1]
    pub fn new(
        factor_type: RiskFactorType,
        weight: f64,
        value: f64,
        polarity: Polarity,
    ) -> Result<Self, RiskError> {
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(RiskError::InvalidWeight(weight));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(RiskError::InvalidValue(value));
        }
        Ok(Self {
            factor_type,
            weight,
            value,
            polarity,
        })
    }

    /// A factor that raises the risk
    ///
    /// # Errors
    /// See [`RiskFactor::new`]
    pub fn negative(factor_type: RiskFactorType, weight: f64, value: f64) -> Result<Self, RiskError> {
        Self::new(factor_type, weight, value, Polarity::Negative)
    }

    /// A factor that lowers the risk
    ///
    /// # Errors
    /// See [`RiskFactor::new`]
    pub fn positive(factor_type: RiskFactorType, weight: f64, value: f64) -> Result<Self, RiskError> {
        Self::new(factor_type, weight, value, Polarity::Positive)
    }

    #[must_use]
    pub fn factor_type(&self) -> RiskFactorType {
        self.factor_type
    }

    #[must_use]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn adjusted_value(&self) -> f64 {
        match self.polarity {
            Polarity::Negative => self.value,
            Polarity::Positive => 1.0 - self.value,
        }
    }
}

/// Weighted mean of the adjusted factor values, clamped and rounded to cents
#[must_use]
pub fn aggregate(factors: &[RiskFactor]) -> f64 {
    if factors.is_empty() {
        return BASELINE_SCORE;
    }

    let (weighted_sum, total_weight) = factors.iter().fold((0.0, 0.0), |(sum, total), f| {
        (sum + f.weight * f.adjusted_value(), total + f.weight)
    });
    let score = (weighted_sum / total_weight).clamp(MIN_SCORE, MAX_SCORE);

    // Settle float noise before rounding half-up to two decimals
    let cents = (score * 100.0 * 1e6).round() / 1e6;
    cents.round() / 100.0
}

/// Outcome of scoring one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: f64,
    pub factors: Vec<RiskFactor>,
    /// The neutral score was substituted because assessment failed
    pub fallback: bool,
}

impl RiskAssessment {
    #[must_use]
    pub fn from_factors(factors: Vec<RiskFactor>) -> Self {
        Self {
            score: aggregate(&factors),
            factors,
            fallback: false,
        }
    }

    #[must_use]
    pub fn neutral() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            factors: Vec::new(),
            fallback: true,
        }
    }

    #[must_use]
    pub fn has_factor(&self, factor_type: RiskFactorType) -> bool {
        self.factors.iter().any(|f| f.factor_type == factor_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_bounds() {
        assert!(RiskFactor::negative(RiskFactorType::DeviceUnknown, 0.0, 0.5).is_err());
        assert!(RiskFactor::negative(RiskFactorType::DeviceUnknown, 1.1, 0.5).is_err());
        assert!(RiskFactor::negative(RiskFactorType::DeviceUnknown, f64::NAN, 0.5).is_err());
        assert!(RiskFactor::negative(RiskFactorType::DeviceUnknown, 0.2, -0.1).is_err());
        assert!(RiskFactor::negative(RiskFactorType::DeviceUnknown, 0.2, 1.5).is_err());
        assert!(RiskFactor::negative(RiskFactorType::DeviceUnknown, 1.0, 1.0).is_ok());
        assert!(RiskFactor::positive(RiskFactorType::DeviceUnknown, 0.01, 0.0).is_ok());
    }

    #[test]
    fn test_high_risk_country_with_verification_scores_093() {
        let factors = vec![
            RiskFactor::negative(RiskFactorType::GeographicHighRiskCountry, 0.3, 1.0).unwrap(),
            RiskFactor::positive(RiskFactorType::UserVerificationPerformed, 0.1, 0.3).unwrap(),
        ];
        assert!((aggregate(&factors) - 0.93).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_factors_is_baseline() {
        assert!((aggregate(&[]) - BASELINE_SCORE).abs() < f64::EPSILON);
        assert!(!RiskAssessment::from_factors(vec![]).fallback);
    }

    #[test]
    fn test_score_is_clamped() {
        let worst = vec![RiskFactor::negative(RiskFactorType::AuthenticatorDenylistedModel, 0.4, 1.0).unwrap()];
        assert!((aggregate(&worst) - MAX_SCORE).abs() < f64::EPSILON);

        let best = vec![RiskFactor::positive(RiskFactorType::UserVerificationPerformed, 0.1, 1.0).unwrap()];
        assert!((aggregate(&best) - MIN_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_positive_factor_counts_its_complement() {
        let risky = RiskFactor::negative(RiskFactorType::DeviceUnknown, 0.2, 0.6).unwrap();
        let alone = aggregate(&[risky.clone()]);
        let with_uv = aggregate(&[
            risky,
            RiskFactor::positive(RiskFactorType::UserVerificationPerformed, 0.1, 0.3).unwrap(),
        ]);
        // 0.6 alone; (0.12 + 0.07) / 0.3 = 0.6333 -> 0.63
        assert!((alone - 0.6).abs() < f64::EPSILON);
        assert!((with_uv - 0.63).abs() < f64::EPSILON);
    }

    #[test]
    fn test_neutral_fallback() {
        let assessment = RiskAssessment::neutral();
        assert!(assessment.fallback);
        assert!((assessment.score - NEUTRAL_SCORE).abs() < f64::EPSILON);
    }
}
