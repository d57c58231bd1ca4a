use crate::models::MAX_HORIZON_SECONDS;
use anyhow::{anyhow, Result};
use chrono::Duration;
use std::collections::HashMap;
use std::env;
use std::time::Duration as StdDuration;

pub const SETTING_KEYS: [&str; 8] = [
    "FORECAST_HORIZON_MINUTES",
    "LEARNING_HISTORY_WINDOW",
    "LEARNING_SAMPLE_CAP",
    "RECONCILE_INTERVAL_SECONDS",
    "ACCURACY_SCALE",
    "MAX_RESOLUTION_ATTEMPTS",
    "PRICE_LOOKUP_TIMEOUT_SECONDS",
    "MAX_PRICE_AGE_MINUTES",
];

pub const MAX_FORECAST_HORIZON_MINUTES: i64 = MAX_HORIZON_SECONDS / 60;
pub const MAX_PRICE_AGE_LIMIT_MINUTES: i64 = 30 * 24 * 60;
pub const MAX_RECONCILE_INTERVAL_SECONDS: u64 = 24 * 60 * 60;
pub const MAX_PRICE_LOOKUP_TIMEOUT_SECONDS: u64 = 60 * 60;
const MAX_HISTORY_WINDOW: u64 = 10_000;

/// Runtime knobs for the calibration loop.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    pub forecast_horizon_minutes: i64,
    pub history_window: usize,
    pub sample_cap: u32,
    pub reconcile_interval_seconds: u64,
    pub accuracy_scale: f64,
    pub max_resolution_attempts: u32,
    pub price_lookup_timeout_seconds: u64,
    pub max_price_age_minutes: i64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            forecast_horizon_minutes: 20,
            history_window: 50,
            sample_cap: 100,
            reconcile_interval_seconds: 300,
            accuracy_scale: 1000.0,
            max_resolution_attempts: 12,
            price_lookup_timeout_seconds: 10,
            max_price_age_minutes: 60,
        }
    }
}

impl CalibrationSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            forecast_horizon_minutes: optional_setting_u64(
                settings,
                "FORECAST_HORIZON_MINUTES",
                defaults.forecast_horizon_minutes as u64,
                1,
                MAX_FORECAST_HORIZON_MINUTES as u64,
            )? as i64,
            history_window: optional_setting_u64(
                settings,
                "LEARNING_HISTORY_WINDOW",
                defaults.history_window as u64,
                1,
                MAX_HISTORY_WINDOW,
            )? as usize,
            sample_cap: optional_setting_u64(
                settings,
                "LEARNING_SAMPLE_CAP",
                defaults.sample_cap as u64,
                1,
                u32::MAX as u64,
            )? as u32,
            reconcile_interval_seconds: optional_setting_u64(
                settings,
                "RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval_seconds,
                1,
                MAX_RECONCILE_INTERVAL_SECONDS,
            )?,
            accuracy_scale: optional_setting_f64(
                settings,
                "ACCURACY_SCALE",
                defaults.accuracy_scale,
                Some(f64::MIN_POSITIVE),
                None,
            )?,
            max_resolution_attempts: optional_setting_u64(
                settings,
                "MAX_RESOLUTION_ATTEMPTS",
                defaults.max_resolution_attempts as u64,
                1,
                i32::MAX as u64,
            )? as u32,
            price_lookup_timeout_seconds: optional_setting_u64(
                settings,
                "PRICE_LOOKUP_TIMEOUT_SECONDS",
                defaults.price_lookup_timeout_seconds,
                1,
                MAX_PRICE_LOOKUP_TIMEOUT_SECONDS,
            )?,
            max_price_age_minutes: optional_setting_u64(
                settings,
                "MAX_PRICE_AGE_MINUTES",
                defaults.max_price_age_minutes as u64,
                1,
                MAX_PRICE_AGE_LIMIT_MINUTES as u64,
            )? as i64,
        })
    }

    /// Environment variables with the same key win over stored settings.
    pub fn with_env_overrides(mut settings: HashMap<String, String>) -> HashMap<String, String> {
        for key in SETTING_KEYS {
            if let Ok(value) = env::var(key) {
                if !value.trim().is_empty() {
                    settings.insert(key.to_string(), value);
                }
            }
        }
        settings
    }

    pub fn forecast_horizon(&self) -> Duration {
        Duration::minutes(
            self.forecast_horizon_minutes
                .clamp(1, MAX_FORECAST_HORIZON_MINUTES),
        )
    }

    pub fn reconcile_interval(&self) -> StdDuration {
        StdDuration::from_secs(
            self.reconcile_interval_seconds
                .clamp(1, MAX_RECONCILE_INTERVAL_SECONDS),
        )
    }

    pub fn price_lookup_timeout(&self) -> StdDuration {
        StdDuration::from_secs(
            self.price_lookup_timeout_seconds
                .clamp(1, MAX_PRICE_LOOKUP_TIMEOUT_SECONDS),
        )
    }

    pub fn max_price_age(&self) -> Duration {
        Duration::minutes(self.max_price_age_minutes.clamp(1, MAX_PRICE_AGE_LIMIT_MINUTES))
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    if value > max as f64 {
        return Err(anyhow!(
            "Setting {} must be <= {} (value: {})",
            key,
            max,
            raw
        ));
    }
    Ok(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_map_yields_defaults() {
        let settings = CalibrationSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(settings, CalibrationSettings::default());
        assert_eq!(settings.forecast_horizon(), Duration::minutes(20));
        assert_eq!(settings.reconcile_interval(), StdDuration::from_secs(300));
    }

    #[test]
    fn parses_overrides_and_ignores_blank_values() {
        let settings = CalibrationSettings::from_settings_map(&map(&[
            ("FORECAST_HORIZON_MINUTES", "45"),
            ("ACCURACY_SCALE", "500"),
            ("MAX_RESOLUTION_ATTEMPTS", " "),
        ]))
        .unwrap();
        assert_eq!(settings.forecast_horizon_minutes, 45);
        assert_eq!(settings.accuracy_scale, 500.0);
        assert_eq!(settings.max_resolution_attempts, 12);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = CalibrationSettings::from_settings_map(&map(&[("LEARNING_HISTORY_WINDOW", "2.5")]))
            .unwrap_err();
        assert!(err.to_string().contains("LEARNING_HISTORY_WINDOW"));

        let err = CalibrationSettings::from_settings_map(&map(&[("ACCURACY_SCALE", "-1")]))
            .unwrap_err();
        assert!(err.to_string().contains("ACCURACY_SCALE"));

        let err = CalibrationSettings::from_settings_map(&map(&[(
            "RECONCILE_INTERVAL_SECONDS",
            "soon",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("must be a number"));
    }

    #[test]
    fn rejects_values_beyond_upper_bounds() {
        for (key, value) in [
            ("FORECAST_HORIZON_MINUTES", "1e19"),
            ("FORECAST_HORIZON_MINUTES", "10081"),
            ("MAX_PRICE_AGE_MINUTES", "9223372036854775807"),
            ("RECONCILE_INTERVAL_SECONDS", "86401"),
            ("PRICE_LOOKUP_TIMEOUT_SECONDS", "3601"),
            ("MAX_RESOLUTION_ATTEMPTS", "5000000000"),
        ] {
            let err = CalibrationSettings::from_settings_map(&map(&[(key, value)])).unwrap_err();
            assert!(err.to_string().contains("must be <="), "{}={}", key, value);
        }

        let settings =
            CalibrationSettings::from_settings_map(&map(&[("FORECAST_HORIZON_MINUTES", "10080")]))
                .unwrap();
        assert_eq!(settings.forecast_horizon(), Duration::days(7));
    }

    #[test]
    fn accessors_stay_in_range_for_hand_built_settings() {
        let settings = CalibrationSettings {
            forecast_horizon_minutes: i64::MAX,
            max_price_age_minutes: i64::MAX,
            reconcile_interval_seconds: u64::MAX,
            price_lookup_timeout_seconds: 0,
            ..CalibrationSettings::default()
        };
        assert_eq!(settings.forecast_horizon(), Duration::days(7));
        assert_eq!(settings.max_price_age(), Duration::days(30));
        assert_eq!(settings.reconcile_interval(), StdDuration::from_secs(86_400));
        assert_eq!(settings.price_lookup_timeout(), StdDuration::from_secs(1));
    }
}
