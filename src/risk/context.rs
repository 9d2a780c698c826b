//! Inputs to risk scoring

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::SecurityTier;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance (haversine)
    #[must_use]
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskOperation {
    Registration,
    #[default]
    Authentication,
}

/// What is known about the authenticator taking part in the operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthenticatorProfile {
    /// AAGUID of the authenticator model
    pub model_id: Option<String>,
    pub user_verified: bool,
    pub backup_eligible: bool,
    /// Previous use of the credential; `None` at registration
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-request facts supplied by the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskContext {
    pub tenant_id: String,
    pub user_id: String,
    pub operation: RiskOperation,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    /// ISO 3166 alpha-2 country resolved upstream from the address
    pub country_code: Option<String>,
    pub location: Option<GeoPoint>,
    pub proxy_detected: bool,
    /// Time the client spent in the ceremony
    pub session_duration: Option<Duration>,
    pub at: DateTime<Utc>,
    pub authenticator: AuthenticatorProfile,
}

/// History loaded from the risk signal source for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskSignals {
    pub habitual_location: Option<GeoPoint>,
    pub frequent_addresses: Vec<String>,
    pub known_devices: Vec<String>,
    pub attempts_last_minute: usize,
    pub attempts_last_five_minutes: usize,
    pub attempts_last_hour: usize,
    pub security_tier: Option<SecurityTier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_known_cities() {
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let new_york = GeoPoint::new(40.7128, -74.0060);

        let lp = london.distance_km(&paris);
        assert!((330.0..360.0).contains(&lp), "london-paris {lp}");

        let ln = london.distance_km(&new_york);
        assert!((5500.0..5650.0).contains(&ln), "london-new york {ln}");

        assert!(london.distance_km(&london).abs() < 1e-9);
    }
}
