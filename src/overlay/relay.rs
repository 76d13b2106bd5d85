//! Relay directory and selection.
//!
//! Subscriptions and publishes for a geohash channel go to the relays
//! nearest the channel's cell center, so traffic for a location stays on
//! infrastructure near that location. The directory ships embedded as
//! CSV (`host,lat,lon`), deduplicated by host at load.

use std::time::Duration;

use tracing::warn;

use crate::geohash;

/// Embedded relay directory.
const RELAY_DIRECTORY_CSV: &str = include_str!("../../data/relays.csv");

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A directory entry.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayEntry {
    /// Bare hostname (no scheme).
    pub host: String,
    /// Approximate latitude in degrees.
    pub lat: f64,
    /// Approximate longitude in degrees.
    pub lon: f64,
}

/// The relay directory.
#[derive(Clone, Debug)]
pub struct RelayDirectory {
    entries: Vec<RelayEntry>,
}

impl RelayDirectory {
    /// Load the embedded directory.
    pub fn embedded() -> Self {
        Self::from_csv(RELAY_DIRECTORY_CSV)
    }

    /// Parse a CSV directory, skipping comments and malformed rows,
    /// deduplicating by host (first row wins).
    pub fn from_csv(csv: &str) -> Self {
        let mut entries: Vec<RelayEntry> = Vec::new();
        for line in csv.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',');
            let (Some(host), Some(lat), Some(lon)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!(line, "Skipping malformed relay directory row");
                continue;
            };
            let (Ok(lat), Ok(lon)) = (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) else {
                warn!(line, "Skipping relay row with unparseable coordinates");
                continue;
            };
            let host = host.trim().to_ascii_lowercase();
            if entries.iter().any(|e| e.host == host) {
                continue;
            }
            entries.push(RelayEntry { host, lat, lon });
        }
        Self { entries }
    }

    /// Number of distinct relays.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `count` relays nearest the center of `geohash`, as `wss://`
    /// URLs, nearest first. An undecodable geohash yields no relays.
    pub fn closest_to_geohash(&self, geohash: &str, count: usize) -> Vec<String> {
        let Ok((lat, lon)) = geohash::decode_center(geohash) else {
            return Vec::new();
        };

        let mut by_distance: Vec<(f64, &RelayEntry)> = self
            .entries
            .iter()
            .map(|entry| (haversine_km(lat, lon, entry.lat, entry.lon), entry))
            .collect();
        by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));

        by_distance
            .into_iter()
            .take(count)
            .map(|(_, entry)| format!("wss://{}", entry.host))
            .collect()
    }
}

/// Great-circle distance between two points in kilometers.
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

// ============================================================================
// Reconnect backoff
// ============================================================================

/// Per-relay reconnection backoff schedule: 1 s initial, doubling, capped
/// at 300 s, at most 10 attempts. The relay client consumes this; the
/// core only defines the schedule.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    attempt: u32,
}

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Attempts before giving up on a relay.
const BACKOFF_MAX_ATTEMPTS: u32 = 10;

impl ReconnectBackoff {
    /// Fresh schedule (no attempts made).
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Delay before the next attempt, or None once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= BACKOFF_MAX_ATTEMPTS {
            return None;
        }
        let multiplier = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let delay = BACKOFF_INITIAL
            .checked_mul(multiplier as u32)
            .unwrap_or(BACKOFF_CAP)
            .min(BACKOFF_CAP);
        self.attempt += 1;
        Some(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_directory_loads() {
        let directory = RelayDirectory::embedded();
        assert!(directory.len() >= 10);
    }

    #[test]
    fn test_dedup_by_host() {
        let directory = RelayDirectory::from_csv(
            "a.example,1.0,2.0\nb.example,3.0,4.0\nA.Example,9.0,9.0\n",
        );
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let directory =
            RelayDirectory::from_csv("# comment\n\na.example,1.0\nb.example,x,y\nc.example,5,6\n");
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.entries[0].host, "c.example");
    }

    #[test]
    fn test_closest_sorted_and_capped() {
        let directory = RelayDirectory::from_csv(
            "eu.example,50.0,9.0\nus.example,40.0,-75.0\njp.example,35.0,139.0\n",
        );
        // ezs42 is in northern Spain: Europe first
        let relays = directory.closest_to_geohash("ezs42", 2);
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0], "wss://eu.example");
        assert_eq!(relays[1], "wss://us.example");
    }

    #[test]
    fn test_invalid_geohash_yields_nothing() {
        let directory = RelayDirectory::embedded();
        assert!(directory.closest_to_geohash("!!", 5).is_empty());
    }

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London is roughly 344 km
        let distance = haversine_km(48.86, 2.35, 51.51, -0.13);
        assert!((330.0..360.0).contains(&distance), "got {}", distance);
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = ReconnectBackoff::new();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        // Delays cap at 300 s
        let mut last = Duration::ZERO;
        for _ in 3..10 {
            last = backoff.next_delay().unwrap();
        }
        assert_eq!(last, Duration::from_secs(300));
        // Attempt 11 gives up
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ReconnectBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
