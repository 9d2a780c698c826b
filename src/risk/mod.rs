//! Risk scoring engine
//!
//! Independent analyzers each emit weighted factors for a request; the engine
//! runs them concurrently and reduces their factors to one bounded score.
//! Scoring never fails: if the request cannot be assessed the neutral score
//! is returned with `fallback` set. What to do with a high score is the
//! caller's decision.

mod analyzers;
mod context;
mod factor;
pub mod user_agent;

use std::sync::Arc;

use chrono::Duration;
use tokio::task::JoinSet;

pub use analyzers::{
    default_analyzers, AuthenticatorAnalyzer, BehavioralAnalyzer, DeviceAnalyzer,
    GeographicAnalyzer, RiskAnalyzer, UsagePatternAnalyzer, VelocityAnalyzer,
    VerificationAnalyzer, FAMILIAR_ADDRESS_COUNT,
};
pub use context::{AuthenticatorProfile, GeoPoint, RiskContext, RiskOperation, RiskSignals};
pub use factor::{
    aggregate, Polarity, RiskAssessment, RiskError, RiskFactor, RiskFactorType, BASELINE_SCORE,
    MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE,
};

use crate::settings::RiskSettings;
use crate::store::{MetadataLookup, RiskSignalSource};

/// Risk scoring engine
pub struct RiskEngine {
    analyzers: Vec<Arc<dyn RiskAnalyzer>>,
    signals: Arc<dyn RiskSignalSource>,
    metadata: Arc<dyn MetadataLookup>,
    high_risk_threshold: f64,
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field(
                "analyzers",
                &self.analyzers.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field("high_risk_threshold", &self.high_risk_threshold)
            .finish_non_exhaustive()
    }
}

impl RiskEngine {
    #[must_use]
    pub fn new(
        settings: &RiskSettings,
        signals: Arc<dyn RiskSignalSource>,
        metadata: Arc<dyn MetadataLookup>,
    ) -> Self {
        Self {
            analyzers: default_analyzers(settings),
            signals,
            metadata,
            high_risk_threshold: settings.high_risk_threshold,
        }
    }

    /// Replace the analyzer set
    #[must_use]
    pub fn with_analyzers(mut self, analyzers: Vec<Arc<dyn RiskAnalyzer>>) -> Self {
        self.analyzers = analyzers;
        self
    }

    /// Load the signals for a request and score it
    pub async fn assess(&self, context: RiskContext) -> RiskAssessment {
        match self.load_signals(&context).await {
            Ok(signals) => self.score(context, signals).await,
            Err(err) => {
                log::error!(
                    "Risk signals unavailable for tenant_id={} user_id={}, using neutral score: {err}",
                    context.tenant_id,
                    context.user_id
                );
                RiskAssessment::neutral()
            }
        }
    }

    /// Score a request from already loaded signals
    ///
    /// A failing or panicking analyzer contributes no factors. If every
    /// analyzer fails the neutral score is returned.
    pub async fn score(&self, context: RiskContext, signals: RiskSignals) -> RiskAssessment {
        if self.analyzers.is_empty() {
            return RiskAssessment::from_factors(Vec::new());
        }

        let context = Arc::new(context);
        let signals = Arc::new(signals);
        let mut tasks = JoinSet::new();
        for (index, analyzer) in self.analyzers.iter().enumerate() {
            let analyzer = Arc::clone(analyzer);
            let context = Arc::clone(&context);
            let signals = Arc::clone(&signals);
            tasks.spawn(async move {
                let result = analyzer.analyze(&context, &signals).await;
                (index, analyzer.name(), result)
            });
        }

        let mut collected: Vec<(usize, Vec<RiskFactor>)> = Vec::with_capacity(self.analyzers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(factors))) => collected.push((index, factors)),
                Ok((_, name, Err(err))) => {
                    log::warn!(
                        "Risk analyzer {name} failed for tenant_id={}: {err}",
                        context.tenant_id
                    );
                }
                Err(err) => {
                    log::error!(
                        "Risk analyzer task aborted for tenant_id={}: {err}",
                        context.tenant_id
                    );
                }
            }
        }

        if collected.is_empty() {
            log::error!(
                "All risk analyzers failed for tenant_id={} user_id={}, using neutral score",
                context.tenant_id,
                context.user_id
            );
            return RiskAssessment::neutral();
        }

        // Keep factor order stable regardless of completion order
        collected.sort_by_key(|(index, _)| *index);
        let factors = collected.into_iter().flat_map(|(_, f)| f).collect();
        let assessment = RiskAssessment::from_factors(factors);
        log::debug!(
            "Risk score {:.2} for tenant_id={} user_id={} ({} factors)",
            assessment.score,
            context.tenant_id,
            context.user_id,
            assessment.factors.len()
        );
        assessment
    }

    /// Whether a score crosses the configured high-risk threshold
    #[must_use]
    pub fn is_high_risk(&self, assessment: &RiskAssessment) -> bool {
        assessment.score > self.high_risk_threshold
    }

    async fn load_signals(&self, context: &RiskContext) -> Result<RiskSignals, RiskError> {
        let tenant = context.tenant_id.as_str();
        let user = context.user_id.as_str();
        let source = |e: crate::store::StoreError| RiskError::Signals(e.to_string());

        let security_tier = match &context.authenticator.model_id {
            Some(model_id) => self
                .metadata
                .get_by_model_id(model_id)
                .await
                .map_err(source)?
                .map(|m| m.security_tier),
            None => None,
        };

        Ok(RiskSignals {
            habitual_location: self.signals.habitual_location(tenant, user).await.map_err(source)?,
            frequent_addresses: self
                .signals
                .frequent_addresses(tenant, user, FAMILIAR_ADDRESS_COUNT)
                .await
                .map_err(source)?,
            known_devices: self.signals.known_devices(tenant, user).await.map_err(source)?,
            attempts_last_minute: self
                .signals
                .recent_attempts(tenant, user, context.at - Duration::minutes(1))
                .await
                .map_err(source)?,
            attempts_last_five_minutes: self
                .signals
                .recent_attempts(tenant, user, context.at - Duration::minutes(5))
                .await
                .map_err(source)?,
            attempts_last_hour: self
                .signals
                .recent_attempts(tenant, user, context.at - Duration::hours(1))
                .await
                .map_err(source)?,
            security_tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryMetadataStore, InMemoryRiskSignals};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct FixedAnalyzer(Vec<RiskFactor>);

    #[async_trait]
    impl RiskAnalyzer for FixedAnalyzer {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn analyze(
            &self,
            _context: &RiskContext,
            _signals: &RiskSignals,
        ) -> Result<Vec<RiskFactor>, RiskError> {
            Ok(self.0.clone())
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl RiskAnalyzer for FailingAnalyzer {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn analyze(
            &self,
            _context: &RiskContext,
            _signals: &RiskSignals,
        ) -> Result<Vec<RiskFactor>, RiskError> {
            Err(RiskError::Analyzer {
                analyzer: "failing",
                message: "boom".to_string(),
            })
        }
    }

    struct PanickingAnalyzer;

    #[async_trait]
    impl RiskAnalyzer for PanickingAnalyzer {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn analyze(
            &self,
            _context: &RiskContext,
            _signals: &RiskSignals,
        ) -> Result<Vec<RiskFactor>, RiskError> {
            panic!("analyzer bug");
        }
    }

    fn engine(analyzers: Vec<Arc<dyn RiskAnalyzer>>) -> RiskEngine {
        RiskEngine::new(
            &RiskSettings::default(),
            Arc::new(InMemoryRiskSignals::new()),
            Arc::new(InMemoryMetadataStore::new()),
        )
        .with_analyzers(analyzers)
    }

    fn scenario_factors() -> Vec<RiskFactor> {
        vec![
            RiskFactor::negative(RiskFactorType::GeographicHighRiskCountry, 0.3, 1.0).unwrap(),
            RiskFactor::positive(RiskFactorType::UserVerificationPerformed, 0.1, 0.3).unwrap(),
        ]
    }

    #[tokio::test]
    async fn test_scenario_score() {
        let engine = engine(vec![Arc::new(FixedAnalyzer(scenario_factors()))]);
        let assessment = engine
            .score(RiskContext::default(), RiskSignals::default())
            .await;
        assert!((assessment.score - 0.93).abs() < f64::EPSILON);
        assert!(engine.is_high_risk(&assessment));
    }

    #[tokio::test]
    async fn test_failing_analyzers_are_isolated() {
        let engine = engine(vec![
            Arc::new(FailingAnalyzer),
            Arc::new(PanickingAnalyzer),
            Arc::new(FixedAnalyzer(scenario_factors())),
        ]);
        let assessment = engine
            .score(RiskContext::default(), RiskSignals::default())
            .await;
        assert!(!assessment.fallback);
        assert_eq!(assessment.factors.len(), 2);
        assert!((assessment.score - 0.93).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_all_analyzers_failing_is_neutral() {
        let engine = engine(vec![Arc::new(FailingAnalyzer), Arc::new(PanickingAnalyzer)]);
        let assessment = engine
            .score(RiskContext::default(), RiskSignals::default())
            .await;
        assert!(assessment.fallback);
        assert!((assessment.score - NEUTRAL_SCORE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_quiet_request_scores_baseline() {
        let engine = engine(vec![Arc::new(FixedAnalyzer(Vec::new()))]);
        let assessment = engine
            .score(RiskContext::default(), RiskSignals::default())
            .await;
        assert!((assessment.score - BASELINE_SCORE).abs() < f64::EPSILON);
        assert!(!engine.is_high_risk(&assessment));
    }

    #[tokio::test]
    async fn test_assess_with_default_analyzers_stays_in_bounds() {
        let signals = Arc::new(InMemoryRiskSignals::new());
        signals.add_known_device("t1", "u1", "fp-1");
        signals.add_address("t1", "u1", "203.0.113.7", 3);
        let engine = RiskEngine::new(
            &RiskSettings::default(),
            signals,
            Arc::new(InMemoryMetadataStore::new()),
        );

        let mut context = RiskContext {
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            ip: Some("203.0.113.7".to_string()),
            device_fingerprint: Some("fp-1".to_string()),
            at: Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap(),
            ..RiskContext::default()
        };
        context.authenticator.user_verified = true;

        let assessment = engine.assess(context).await;
        assert!(!assessment.fallback);
        // Only the positive verification credit fires
        assert_eq!(assessment.factors.len(), 1);
        assert!(assessment.has_factor(RiskFactorType::UserVerificationPerformed));
        assert!(!assessment.has_factor(RiskFactorType::DeviceUnknown));
        assert!((MIN_SCORE..=MAX_SCORE).contains(&assessment.score));
        assert!((assessment.score - 0.7).abs() < f64::EPSILON);
    }
}
