use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::GeoPoint;

/// Facts about the HTTP request carrying a ceremony
///
/// Location and proxy data are resolved by the caller (e.g. from an IP
/// intelligence service); the core only consumes them.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Ties log lines and audit events of one request together
    pub correlation_id: String,
    pub tenant_id: String,
    pub region: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub country_code: Option<String>,
    pub location: Option<GeoPoint>,
    pub proxy_detected: bool,
    pub session_duration: Option<Duration>,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    /// A context with a fresh correlation ID
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            region: None,
            ip: None,
            user_agent: None,
            device_fingerprint: None,
            country_code: None,
            location: None,
            proxy_detected: false,
            session_duration: None,
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn with_client(mut self, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_device(mut self, fingerprint: impl Into<String>) -> Self {
        self.device_fingerprint = Some(fingerprint.into());
        self
    }
}

/// The user a credential is being registered for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    pub name: String,
    pub display_name: String,
}

/// Result of a successful authentication
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationOutcome {
    pub user_id: String,
    pub tenant_id: String,
    pub credential_id: uuid::Uuid,
    pub trust_level: crate::credential::TrustLevel,
    pub risk_score: f64,
    pub high_risk: bool,
}
