use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub type Symbol = String;

/// Longest horizon a forecast may target (one week).
pub const MAX_HORIZON_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub ticker: String,
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume_shares: i64,
}

/// Latest known price for a symbol. May be stale; callers decide how old is too old.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub price: f64,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalSnapshot {
    pub rsi: f64,
    pub macd: f64,
    pub volatility: f64,
    pub stochastic_k: f64,
    pub bollinger: BollingerBands,
    pub volume: f64,
}

impl TechnicalSnapshot {
    pub fn is_well_formed(&self) -> bool {
        let bands = &self.bollinger;
        self.rsi.is_finite()
            && (0.0..=100.0).contains(&self.rsi)
            && self.macd.is_finite()
            && self.volatility.is_finite()
            && self.volatility >= 0.0
            && self.stochastic_k.is_finite()
            && (0.0..=100.0).contains(&self.stochastic_k)
            && bands.upper.is_finite()
            && bands.middle.is_finite()
            && bands.lower.is_finite()
            && bands.upper >= bands.lower
            && self.volume.is_finite()
    }

    /// Replaces malformed readings with values that contribute nothing to a forecast.
    pub fn sanitized(&self, current_price: f64) -> Self {
        let in_percent_range = |value: f64| value.is_finite() && (0.0..=100.0).contains(&value);
        let bands = &self.bollinger;
        let bands_valid = bands.upper.is_finite()
            && bands.middle.is_finite()
            && bands.lower.is_finite()
            && bands.upper >= bands.lower;

        Self {
            rsi: if in_percent_range(self.rsi) { self.rsi } else { 50.0 },
            macd: if self.macd.is_finite() { self.macd } else { 0.0 },
            volatility: if self.volatility.is_finite() && self.volatility >= 0.0 {
                self.volatility
            } else {
                0.0
            },
            stochastic_k: if in_percent_range(self.stochastic_k) {
                self.stochastic_k
            } else {
                50.0
            },
            bollinger: if bands_valid {
                *bands
            } else {
                BollingerBands {
                    upper: current_price,
                    middle: current_price,
                    lower: current_price,
                }
            },
            volume: if self.volume.is_finite() { self.volume } else { 0.0 },
        }
    }
}

/// Aggregate forecast-error statistics for a single symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningState {
    pub avg_error: f64,
    pub direction_accuracy: f64,
    pub magnitude_accuracy: f64,
    pub sample_count: u32,
    pub trend_bias: f64,
    pub volatility_bias: f64,
    pub momentum_bias: f64,
}

impl Default for LearningState {
    fn default() -> Self {
        Self {
            avg_error: 0.0,
            direction_accuracy: 50.0,
            magnitude_accuracy: 50.0,
            sample_count: 0,
            trend_bias: 1.0,
            volatility_bias: 1.0,
            momentum_bias: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedParameters {
    pub trend_multiplier: f64,
    pub volatility_adjustment: f64,
    pub momentum_weight: f64,
    pub direction_bias: f64,
    pub conservatism_factor: f64,
}

impl LearnedParameters {
    pub const NEUTRAL: LearnedParameters = LearnedParameters {
        trend_multiplier: 1.0,
        volatility_adjustment: 1.0,
        momentum_weight: 1.0,
        direction_bias: 0.0,
        conservatism_factor: 1.0,
    };

    pub fn is_finite(&self) -> bool {
        self.trend_multiplier.is_finite()
            && self.volatility_adjustment.is_finite()
            && self.momentum_weight.is_finite()
            && self.direction_bias.is_finite()
            && self.conservatism_factor.is_finite()
    }
}

impl Default for LearnedParameters {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastState {
    Pending,
    Resolved,
    Expired,
}

impl ForecastState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastState::Pending => "pending",
            ForecastState::Resolved => "resolved",
            ForecastState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ForecastState::Pending)
    }
}

impl FromStr for ForecastState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ForecastState::Pending),
            "resolved" => Ok(ForecastState::Resolved),
            "expired" => Ok(ForecastState::Expired),
            other => Err(anyhow::anyhow!("Unknown forecast state '{}'", other)),
        }
    }
}

/// Per-component contributions behind a forecast, in price units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastComponents {
    pub trend: f64,
    pub rsi: f64,
    pub macd: f64,
    pub bollinger: f64,
    pub volatility: f64,
    pub raw_change: f64,
    pub adjusted_change: f64,
    pub final_change: f64,
    pub was_clamped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastRecord {
    pub id: String,
    pub symbol: Symbol,
    pub created_at: DateTime<Utc>,
    pub horizon_seconds: i64,
    pub original_price: f64,
    pub predicted_price: f64,
    pub confidence: f64,
    pub parameters: LearnedParameters,
    pub state: ForecastState,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_price: Option<f64>,
    #[serde(default)]
    pub accuracy_score: Option<f64>,
    #[serde(default)]
    pub resolution_attempts: u32,
}

impl ForecastRecord {
    /// `None` when the stored horizon is non-positive or longer than [`MAX_HORIZON_SECONDS`].
    pub fn horizon(&self) -> Option<Duration> {
        if self.horizon_seconds <= 0 || self.horizon_seconds > MAX_HORIZON_SECONDS {
            return None;
        }
        Duration::try_seconds(self.horizon_seconds)
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.checked_add_signed(self.horizon()?)
    }

    /// Records with an unusable horizon are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at().is_some_and(|due_at| now >= due_at)
    }

    /// Applies a resolution. Returns false without touching the record if it already left PENDING.
    pub fn resolve(
        &mut self,
        actual_price: f64,
        accuracy_score: f64,
        resolved_at: DateTime<Utc>,
    ) -> bool {
        if self.state != ForecastState::Pending {
            return false;
        }
        self.state = ForecastState::Resolved;
        self.actual_price = Some(actual_price);
        self.accuracy_score = Some(accuracy_score);
        self.resolved_at = Some(resolved_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pending_record() -> ForecastRecord {
        ForecastRecord {
            id: "f-1".to_string(),
            symbol: "AAPL".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap(),
            horizon_seconds: 20 * 60,
            original_price: 100.0,
            predicted_price: 101.0,
            confidence: 70.0,
            parameters: LearnedParameters::NEUTRAL,
            state: ForecastState::Pending,
            resolved_at: None,
            actual_price: None,
            accuracy_score: None,
            resolution_attempts: 0,
        }
    }

    #[test]
    fn record_becomes_due_once_horizon_elapses() {
        let record = pending_record();
        assert!(!record.is_due(record.created_at + Duration::minutes(19)));
        assert!(record.is_due(record.created_at + Duration::minutes(20)));
    }

    #[test]
    fn out_of_range_horizon_is_never_due() {
        let mut record = pending_record();
        record.horizon_seconds = i64::MAX / 2;
        assert!(record.horizon().is_none());
        assert!(record.due_at().is_none());
        assert!(!record.is_due(DateTime::<Utc>::MAX_UTC));

        record.horizon_seconds = 0;
        assert!(record.due_at().is_none());

        record.horizon_seconds = MAX_HORIZON_SECONDS;
        assert_eq!(
            record.due_at(),
            Some(record.created_at + Duration::days(7))
        );
    }

    #[test]
    fn resolve_only_applies_once() {
        let mut record = pending_record();
        let first_at = record.due_at().unwrap();
        assert!(record.resolve(100.5, 95.0, first_at));
        assert!(!record.resolve(99.0, 10.0, first_at + Duration::minutes(5)));
        assert_eq!(record.state, ForecastState::Resolved);
        assert_eq!(record.actual_price, Some(100.5));
        assert_eq!(record.accuracy_score, Some(95.0));
        assert_eq!(record.resolved_at, Some(first_at));
    }

    #[test]
    fn sanitized_snapshot_replaces_malformed_readings() {
        let snapshot = TechnicalSnapshot {
            rsi: f64::NAN,
            macd: f64::INFINITY,
            volatility: -0.2,
            stochastic_k: 140.0,
            bollinger: BollingerBands {
                upper: 90.0,
                middle: 100.0,
                lower: 110.0,
            },
            volume: 1_000.0,
        };
        assert!(!snapshot.is_well_formed());

        let cleaned = snapshot.sanitized(100.0);
        assert!(cleaned.is_well_formed());
        assert_eq!(cleaned.rsi, 50.0);
        assert_eq!(cleaned.macd, 0.0);
        assert_eq!(cleaned.volatility, 0.0);
        assert_eq!(cleaned.stochastic_k, 50.0);
        assert_eq!(cleaned.bollinger.middle, 100.0);
        assert_eq!(cleaned.volume, 1_000.0);
    }

    #[test]
    fn forecast_state_parses_case_insensitively() {
        assert_eq!(
            "RESOLVED".parse::<ForecastState>().unwrap(),
            ForecastState::Resolved
        );
        assert!("unknown".parse::<ForecastState>().is_err());
        assert!(ForecastState::Expired.is_terminal());
        assert!(!ForecastState::Pending.is_terminal());
    }
}
