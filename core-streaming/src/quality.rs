//! # Quality Tiers and Resolution
//!
//! Closed set of audio bitrates plus the pure resolver that picks the tier to
//! serve for a request.
//!
//! ## Resolution order
//!
//! 1. Nothing available: [`ResolveError::NoStreamAvailable`].
//! 2. On cellular, a configured `cellular_max_quality` lowers the request.
//! 3. Exact match wins.
//! 4. With fallback disabled: [`ResolveError::QualityUnavailable`].
//! 5. Nearest tier below the request, else nearest tier above.
//!
//! Offline is not special-cased here. The caller passes cache-resident tiers
//! as `available` when there is no connectivity.

use crate::config::StreamingConfig;
use crate::error::StreamingError;
use crate::network::NetworkState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Audio quality tier. Ordering follows bitrate (`Kbps12` is lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityTier {
    #[serde(rename = "12kbps")]
    Kbps12,
    #[serde(rename = "48kbps")]
    Kbps48,
    #[serde(rename = "128kbps")]
    Kbps128,
    #[serde(rename = "320kbps")]
    Kbps320,
}

impl QualityTier {
    /// All tiers, highest first.
    pub const ALL: [QualityTier; 4] = [
        QualityTier::Kbps320,
        QualityTier::Kbps128,
        QualityTier::Kbps48,
        QualityTier::Kbps12,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Kbps12 => "12kbps",
            QualityTier::Kbps48 => "48kbps",
            QualityTier::Kbps128 => "128kbps",
            QualityTier::Kbps320 => "320kbps",
        }
    }

    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            QualityTier::Kbps12 => 12,
            QualityTier::Kbps48 => 48,
            QualityTier::Kbps128 => 128,
            QualityTier::Kbps320 => 320,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not one of the known tiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown quality tier: {0:?}")]
pub struct ParseQualityError(pub String);

impl FromStr for QualityTier {
    type Err = ParseQualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        QualityTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == normalized)
            .ok_or_else(|| ParseQualityError(s.to_string()))
    }
}

/// One cacheable artifact: a track at a specific tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub track_id: String,
    pub quality: QualityTier,
}

impl TrackIdentity {
    pub fn new(track_id: impl Into<String>, quality: QualityTier) -> Self {
        Self {
            track_id: track_id.into(),
            quality,
        }
    }
}

impl fmt::Display for TrackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.track_id, self.quality)
    }
}

/// Resolution failure, before it is attributed to a track.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("quality {requested} unavailable")]
    QualityUnavailable {
        requested: QualityTier,
        /// Highest first.
        available: Vec<QualityTier>,
    },
    #[error("no stream available")]
    NoStreamAvailable,
}

impl ResolveError {
    pub fn for_track(self, track_id: &str) -> StreamingError {
        match self {
            ResolveError::QualityUnavailable {
                requested,
                available,
            } => StreamingError::QualityUnavailable {
                track_id: track_id.to_string(),
                requested,
                available,
            },
            ResolveError::NoStreamAvailable => StreamingError::NoStreamAvailable {
                track_id: track_id.to_string(),
            },
        }
    }
}

/// The request after network policy has been applied.
pub fn effective_request(
    requested: QualityTier,
    network: &NetworkState,
    config: &StreamingConfig,
) -> QualityTier {
    match config.cellular_max_quality {
        Some(cap) if network.is_cellular() => requested.min(cap),
        _ => requested,
    }
}

/// Pick the tier to serve for `requested` out of `available`.
pub fn resolve(
    requested: QualityTier,
    available: &BTreeSet<QualityTier>,
    network: &NetworkState,
    config: &StreamingConfig,
) -> Result<QualityTier, ResolveError> {
    if available.is_empty() {
        return Err(ResolveError::NoStreamAvailable);
    }

    let effective = effective_request(requested, network, config);
    if available.contains(&effective) {
        return Ok(effective);
    }

    if !config.fallback_enabled {
        return Err(ResolveError::QualityUnavailable {
            requested: effective,
            available: available.iter().rev().copied().collect(),
        });
    }

    available
        .range(..effective)
        .next_back()
        .or_else(|| available.range(effective..).next())
        .copied()
        .ok_or(ResolveError::NoStreamAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::NetworkType;
    use QualityTier::*;

    fn set(tiers: &[QualityTier]) -> BTreeSet<QualityTier> {
        tiers.iter().copied().collect()
    }

    fn wifi() -> NetworkState {
        NetworkState::online(NetworkType::WiFi)
    }

    #[test]
    fn test_ordering_and_display() {
        assert!(Kbps320 > Kbps128);
        assert!(Kbps128 > Kbps48);
        assert!(Kbps48 > Kbps12);
        assert_eq!(Kbps320.to_string(), "320kbps");
        assert_eq!(Kbps48.bitrate_kbps(), 48);
    }

    #[test]
    fn test_parse() {
        assert_eq!("128kbps".parse::<QualityTier>().unwrap(), Kbps128);
        assert_eq!(" 320KBPS ".parse::<QualityTier>().unwrap(), Kbps320);
        assert!("256kbps".parse::<QualityTier>().is_err());
        assert!("".parse::<QualityTier>().is_err());
    }

    #[test]
    fn test_serde_uses_display_form() {
        let json = serde_json::to_string(&Kbps12).unwrap();
        assert_eq!(json, "\"12kbps\"");
        let parsed: QualityTier = serde_json::from_str("\"48kbps\"").unwrap();
        assert_eq!(parsed, Kbps48);
        assert!(serde_json::from_str::<QualityTier>("\"64kbps\"").is_err());
    }

    #[test]
    fn test_exact_match() {
        let config = StreamingConfig::default();
        let got = resolve(Kbps128, &set(&[Kbps320, Kbps128]), &wifi(), &config);
        assert_eq!(got, Ok(Kbps128));
    }

    #[test]
    fn test_fallback_prefers_nearest_below() {
        let config = StreamingConfig::default();
        let got = resolve(Kbps320, &set(&[Kbps128, Kbps48]), &wifi(), &config);
        assert_eq!(got, Ok(Kbps128));

        let got = resolve(Kbps128, &set(&[Kbps320, Kbps48, Kbps12]), &wifi(), &config);
        assert_eq!(got, Ok(Kbps48));
    }

    #[test]
    fn test_fallback_walks_up_when_nothing_below() {
        let config = StreamingConfig::default();
        let got = resolve(Kbps48, &set(&[Kbps320, Kbps128]), &wifi(), &config);
        assert_eq!(got, Ok(Kbps128));
    }

    #[test]
    fn test_fallback_disabled() {
        let config = StreamingConfig {
            fallback_enabled: false,
            ..StreamingConfig::default()
        };
        let got = resolve(Kbps128, &set(&[Kbps320]), &wifi(), &config);
        assert_eq!(
            got,
            Err(ResolveError::QualityUnavailable {
                requested: Kbps128,
                available: vec![Kbps320],
            })
        );
    }

    #[test]
    fn test_empty_available() {
        let config = StreamingConfig {
            fallback_enabled: false,
            ..StreamingConfig::default()
        };
        assert_eq!(
            resolve(Kbps128, &BTreeSet::new(), &wifi(), &config),
            Err(ResolveError::NoStreamAvailable)
        );
    }

    #[test]
    fn test_cellular_cap() {
        let config = StreamingConfig {
            cellular_max_quality: Some(Kbps128),
            ..StreamingConfig::default()
        };
        let all = set(&QualityTier::ALL);

        let cellular = NetworkState::online(NetworkType::Cellular);
        assert_eq!(resolve(Kbps320, &all, &cellular, &config), Ok(Kbps128));
        assert_eq!(resolve(Kbps48, &all, &cellular, &config), Ok(Kbps48));
        assert_eq!(resolve(Kbps320, &all, &wifi(), &config), Ok(Kbps320));
    }

    #[test]
    fn test_offline_resolves_against_given_set() {
        let config = StreamingConfig::default();
        let got = resolve(Kbps320, &set(&[Kbps48]), &NetworkState::offline(), &config);
        assert_eq!(got, Ok(Kbps48));
    }

    #[test]
    fn test_resolve_error_for_track() {
        let err = ResolveError::NoStreamAvailable.for_track("t9");
        assert_eq!(
            err,
            StreamingError::NoStreamAvailable {
                track_id: "t9".to_string()
            }
        );
    }
}
