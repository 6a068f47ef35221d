//! Impossible-travel detection.
//!
//! Each user gets a profile: the set of places they usually log in from
//! and the last place they were seen. A login from a usual place is never
//! questioned. A login from a new place is checked against the previous
//! sighting: if the elapsed time is shorter than the minimum travel time
//! at airliner speed *and* shorter than the reporting threshold, the
//! observation comes back as a `GeographicAnomaly` draft for the caller to
//! record.
//!
//! Places are compared at region granularity ([`GeoPoint::location_key`]);
//! coordinate jitter between lookups of the same city must not look like
//! movement.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{Clock, EventDetails, GeoPoint, SecurityEventType};

use crate::event::EventDraft;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Tuning knobs for the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoAnomalyConfig {
    /// Assumed maximum travel speed in km/h.
    pub travel_speed_kmh: f64,
    /// Hops with more elapsed time than this are never reported, even when
    /// faster than `travel_speed_kmh` allows.
    pub threshold_hours: f64,
    /// Non-anomalous sightings of a new place before it becomes usual.
    pub promotion_sightings: u32,
}

impl Default for GeoAnomalyConfig {
    fn default() -> Self {
        Self {
            travel_speed_kmh: 500.0,
            threshold_hours: 4.0,
            promotion_sightings: 3,
        }
    }
}

/// A place a user habitually logs in from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsualLocation {
    /// Region-granularity key, e.g. `"US/California"`.
    pub key: String,
    /// Grows by 0.1 per sighting, capped at 1.0. Seed locations start at
    /// 1.0, promoted ones at 0.5.
    pub confidence: f64,
    pub sightings: u32,
}

#[derive(Debug, Clone)]
struct LastSeen {
    point: GeoPoint,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct GeoProfile {
    usual: Vec<UsualLocation>,
    /// Non-anomalous sighting counts for places not yet usual.
    candidates: HashMap<String, u32>,
    last: Option<LastSeen>,
    /// Per-user override of [`GeoAnomalyConfig::threshold_hours`].
    threshold_hours: Option<f64>,
}

/// Stateful impossible-travel detector over all users.
pub struct GeoAnomalyDetector {
    profiles: RwLock<HashMap<String, GeoProfile>>,
    config: GeoAnomalyConfig,
    clock: Arc<dyn Clock>,
}

impl GeoAnomalyDetector {
    pub fn new(config: GeoAnomalyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Feeds one located sighting of `user_id` into the detector.
    ///
    /// Returns a `GeographicAnomaly` draft when the hop from the previous
    /// sighting is too fast, `None` otherwise. The profile's last-seen
    /// place is updated either way, so consecutive anomalies are each
    /// judged against the hop that preceded them.
    pub fn observe(
        &self,
        user_id: &str,
        point: &GeoPoint,
        ip_address: &str,
        user_agent: Option<&str>,
    ) -> Option<EventDraft> {
        let now = self.clock.now();
        let key = point.location_key();
        let mut profiles = self.profiles.write().expect("lock poisoned");
        let profile = profiles.entry(user_id.to_string()).or_default();

        // First sighting seeds the profile; there is nothing to compare.
        if profile.last.is_none() {
            profile.usual.push(UsualLocation {
                key,
                confidence: 1.0,
                sightings: 1,
            });
            profile.last = Some(LastSeen {
                point: point.clone(),
                seen_at: now,
            });
            return None;
        }

        // A usual place is trusted without a travel check.
        if let Some(usual) = profile.usual.iter_mut().find(|usual| usual.key == key) {
            usual.sightings = usual.sightings.saturating_add(1);
            usual.confidence = (usual.confidence + 0.1).min(1.0);
            profile.last = Some(LastSeen {
                point: point.clone(),
                seen_at: now,
            });
            return None;
        }

        let threshold_hours = profile.threshold_hours.unwrap_or(self.config.threshold_hours);
        let mut draft = None;
        if let Some(last) = &profile.last {
            let distance_km = haversine_km(&last.point, point);
            let elapsed_hours = hours_between(last.seen_at, now);
            let min_travel_hours = distance_km / self.config.travel_speed_kmh;

            if elapsed_hours < min_travel_hours && elapsed_hours < threshold_hours {
                tracing::info!(
                    user_id,
                    from = %last.point,
                    to = %point,
                    distance_km,
                    elapsed_hours,
                    "impossible travel detected"
                );
                let mut anomaly = EventDraft::new(SecurityEventType::GeographicAnomaly, ip_address)
                    .with_user(user_id)
                    .with_geolocation(point.clone())
                    .with_details(
                        EventDetails::new()
                            .with("from_location", last.point.to_string())
                            .with("to_location", point.to_string())
                            .with("distance_km", distance_km)
                            .with("elapsed_hours", elapsed_hours)
                            .with("min_travel_hours", min_travel_hours),
                    );
                if let Some(user_agent) = user_agent {
                    anomaly = anomaly.with_user_agent(user_agent);
                }
                draft = Some(anomaly);
            }
        }

        if draft.is_none() {
            // A clean sighting of a new place counts toward promotion;
            // an anomalous one does not.
            let sightings = profile.candidates.entry(key.clone()).or_insert(0);
            *sightings = sightings.saturating_add(1);
            if *sightings >= self.config.promotion_sightings {
                let sightings = *sightings;
                profile.candidates.remove(&key);
                profile.usual.push(UsualLocation {
                    key: key.clone(),
                    confidence: 0.5,
                    sightings,
                });
                tracing::debug!(user_id, location = key, "location promoted to usual");
            }
        }

        profile.last = Some(LastSeen {
            point: point.clone(),
            seen_at: now,
        });
        draft
    }

    /// Overrides the reporting threshold for one user; `None` restores the
    /// configured default.
    pub fn set_user_threshold(&self, user_id: &str, threshold_hours: Option<f64>) {
        let mut profiles = self.profiles.write().expect("lock poisoned");
        profiles
            .entry(user_id.to_string())
            .or_default()
            .threshold_hours = threshold_hours;
    }

    /// The places currently considered usual for `user_id`.
    pub fn usual_locations(&self, user_id: &str) -> Vec<UsualLocation> {
        let profiles = self.profiles.read().expect("lock poisoned");
        profiles
            .get(user_id)
            .map(|profile| profile.usual.clone())
            .unwrap_or_default()
    }

    /// Number of users with a profile.
    pub fn profile_count(&self) -> usize {
        self.profiles.read().expect("lock poisoned").len()
    }
}

/// Great-circle distance between two points, in kilometers.
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use tollgate_types::ManualClock;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn san_francisco() -> GeoPoint {
        GeoPoint::new("US", "California", "San Francisco", 37.7749, -122.4194)
    }

    fn tokyo() -> GeoPoint {
        GeoPoint::new("JP", "Tokyo", "Tokyo", 35.6762, 139.6503)
    }

    fn london() -> GeoPoint {
        GeoPoint::new("GB", "England", "London", 51.5074, -0.1278)
    }

    fn las_vegas() -> GeoPoint {
        GeoPoint::new("US", "Nevada", "Las Vegas", 36.1699, -115.1398)
    }

    struct Rig {
        detector: GeoAnomalyDetector,
        clock: Arc<ManualClock>,
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::new(start()));
        Rig {
            detector: GeoAnomalyDetector::new(GeoAnomalyConfig::default(), clock.clone()),
            clock,
        }
    }

    fn observe(rig: &Rig, user: &str, point: &GeoPoint) -> Option<EventDraft> {
        rig.detector.observe(user, point, "203.0.113.7", None)
    }

    #[test]
    fn haversine_matches_known_distances() {
        let sf_tokyo = haversine_km(&san_francisco(), &tokyo());
        assert!((sf_tokyo - 8_270.0).abs() < 100.0, "got {sf_tokyo}");

        let sf_vegas = haversine_km(&san_francisco(), &las_vegas());
        assert!((sf_vegas - 670.0).abs() < 30.0, "got {sf_vegas}");

        assert!(haversine_km(&tokyo(), &tokyo()).abs() < f64::EPSILON);
    }

    #[test]
    fn first_sighting_seeds_the_profile() {
        let r = rig();
        assert!(observe(&r, "user-1", &san_francisco()).is_none());

        let usual = r.detector.usual_locations("user-1");
        assert_eq!(usual.len(), 1);
        assert_eq!(usual[0].key, "US/California");
        assert!((usual[0].confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn impossible_hop_is_reported_with_travel_details() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());
        r.clock.advance(TimeDelta::minutes(30));

        let draft = observe(&r, "user-1", &tokyo()).expect("SF to Tokyo in 30 minutes");
        assert_eq!(draft.event_type, SecurityEventType::GeographicAnomaly);
        assert_eq!(draft.user_id.as_deref(), Some("user-1"));

        let distance = draft
            .details
            .get("distance_km")
            .and_then(tollgate_types::DetailValue::as_f64)
            .expect("distance recorded");
        assert!(distance > 8_000.0);
        let elapsed = draft
            .details
            .get("elapsed_hours")
            .and_then(tollgate_types::DetailValue::as_f64)
            .expect("elapsed recorded");
        assert!((elapsed - 0.5).abs() < 0.01);
    }

    #[test]
    fn slow_enough_travel_is_clean() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());

        // Vegas is ~670 km away: 2 hours is a plausible flight.
        r.clock.advance(TimeDelta::hours(2));
        assert!(observe(&r, "user-1", &las_vegas()).is_none());
    }

    #[test]
    fn hops_older_than_the_threshold_are_never_reported() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());

        // London needs ~17 h at 500 km/h; 6 h elapsed is physically
        // impossible but past the 4 h reporting threshold.
        r.clock.advance(TimeDelta::hours(6));
        assert!(observe(&r, "user-1", &london()).is_none());
    }

    #[test]
    fn usual_locations_short_circuit_the_travel_check() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());
        r.clock.advance(TimeDelta::minutes(30));
        assert!(observe(&r, "user-1", &tokyo()).is_some());

        // Minutes later the user is "back" in their usual region. The
        // compromised session hopping does not re-fire against home.
        r.clock.advance(TimeDelta::minutes(5));
        assert!(observe(&r, "user-1", &san_francisco()).is_none());
    }

    #[test]
    fn new_place_becomes_usual_after_three_clean_sightings() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());

        for _ in 0..2 {
            r.clock.advance(TimeDelta::hours(3));
            assert!(observe(&r, "user-1", &las_vegas()).is_none());
            r.clock.advance(TimeDelta::hours(3));
            assert!(observe(&r, "user-1", &san_francisco()).is_none());
        }
        r.clock.advance(TimeDelta::hours(3));
        assert!(observe(&r, "user-1", &las_vegas()).is_none());

        let usual = r.detector.usual_locations("user-1");
        let vegas = usual
            .iter()
            .find(|location| location.key == "US/Nevada")
            .expect("promoted after the third clean sighting");
        assert!((vegas.confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(vegas.sightings, 3);

        // The next sighting takes the usual path and grows confidence.
        r.clock.advance(TimeDelta::hours(3));
        assert!(observe(&r, "user-1", &las_vegas()).is_none());
        let usual = r.detector.usual_locations("user-1");
        let vegas = usual
            .iter()
            .find(|location| location.key == "US/Nevada")
            .expect("still usual");
        assert!((vegas.confidence - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn anomalous_sightings_do_not_count_toward_promotion() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());

        // Anomalous arrival in Tokyo: not a promotion credit.
        r.clock.advance(TimeDelta::minutes(30));
        assert!(observe(&r, "user-1", &tokyo()).is_some());

        // Two clean same-place sightings are still short of the three
        // required.
        for _ in 0..2 {
            r.clock.advance(TimeDelta::hours(1));
            assert!(observe(&r, "user-1", &tokyo()).is_none());
        }
        assert!(
            !r.detector
                .usual_locations("user-1")
                .iter()
                .any(|location| location.key == "JP/Tokyo")
        );

        // The third clean sighting promotes.
        r.clock.advance(TimeDelta::hours(1));
        assert!(observe(&r, "user-1", &tokyo()).is_none());
        assert!(
            r.detector
                .usual_locations("user-1")
                .iter()
                .any(|location| location.key == "JP/Tokyo")
        );
    }

    #[test]
    fn per_user_threshold_override_widens_the_net() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());
        observe(&r, "user-2", &san_francisco());
        r.detector.set_user_threshold("user-2", Some(8.0));

        r.clock.advance(TimeDelta::hours(6));
        // 6 h to London is past the default 4 h threshold...
        assert!(observe(&r, "user-1", &london()).is_none());
        // ...but inside user-2's widened one.
        assert!(observe(&r, "user-2", &london()).is_some());
    }

    #[test]
    fn users_are_isolated() {
        let r = rig();
        observe(&r, "user-1", &san_francisco());
        r.clock.advance(TimeDelta::minutes(30));

        // user-2 has no history; their first sighting anywhere seeds.
        assert!(observe(&r, "user-2", &tokyo()).is_none());
        assert_eq!(r.detector.profile_count(), 2);
    }
}
