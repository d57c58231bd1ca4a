use crate::models::{BollingerBands, Candle, TechnicalSnapshot};

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST_PERIOD: usize = 12;
pub const MACD_SLOW_PERIOD: usize = 26;
pub const MACD_SIGNAL_PERIOD: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;
pub const STOCHASTIC_PERIOD: usize = 14;
pub const VOLATILITY_LOOKBACK: usize = 20;

pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(prices.len());
    ema_values.push(prices[0]);

    for i in 1..prices.len() {
        let ema = (prices[i] * multiplier) + (ema_values[i - 1] * (1.0 - multiplier));
        ema_values.push(ema);
    }

    ema_values
}

pub fn calculate_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast_ema = calculate_ema(prices, fast_period);
    let slow_ema = calculate_ema(prices, slow_period);

    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(fast, slow)| fast - slow)
        .collect();
    let signal_line = calculate_ema(&macd_line, signal_period);
    let histogram = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(macd, signal)| macd - signal)
        .collect();

    (macd_line, signal_line, histogram)
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder-smoothed RSI. Values before the first full period read as 50.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 || prices.len() < period + 1 {
        return vec![50.0; prices.len()];
    }

    let mut rsi_values = vec![50.0; prices.len()];
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    rsi_values
}

/// Bands over the trailing `period` closes (or all of them when fewer are available).
pub fn latest_bollinger_bands(prices: &[f64], period: usize, std_dev: f64) -> Option<BollingerBands> {
    if prices.is_empty() || period == 0 {
        return None;
    }
    let window = &prices[prices.len().saturating_sub(period)..];
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let variance = window.iter().map(|value| (value - mean).powi(2)).sum::<f64>()
        / window.len() as f64;
    let width = std_dev * variance.sqrt();

    Some(BollingerBands {
        upper: mean + width,
        middle: mean,
        lower: mean - width,
    })
}

/// Fast stochastic %K of the latest candle. A flat range reads as 50.
pub fn latest_stochastic_k(candles: &[Candle], period: usize) -> Option<f64> {
    let last = candles.last()?;
    if period == 0 {
        return None;
    }
    let window = &candles[candles.len().saturating_sub(period)..];
    let highest = window
        .iter()
        .map(|candle| candle.high)
        .fold(f64::NEG_INFINITY, f64::max);
    let lowest = window
        .iter()
        .map(|candle| candle.low)
        .fold(f64::INFINITY, f64::min);
    let range = highest - lowest;
    if !range.is_finite() || range <= 0.0 {
        return Some(50.0);
    }
    Some(((last.close - lowest) / range * 100.0).clamp(0.0, 100.0))
}

/// Simple returns between consecutive prices, skipping non-positive bases.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect()
}

/// Standard deviation of the trailing `lookback` simple returns.
pub fn return_volatility(prices: &[f64], lookback: usize) -> f64 {
    let returns = simple_returns(prices);
    let window = &returns[returns.len().saturating_sub(lookback)..];
    if window.len() < 2 {
        return 0.0;
    }
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let variance =
        window.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / window.len() as f64;
    variance.sqrt()
}

/// Builds a snapshot from candles ordered oldest first. Short histories produce the
/// neutral reading for any indicator that lacks enough data.
pub fn snapshot_from_candles(candles: &[Candle]) -> Option<TechnicalSnapshot> {
    let last = candles.last()?;
    let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();

    let rsi = calculate_rsi(&closes, RSI_PERIOD)
        .last()
        .copied()
        .unwrap_or(50.0);
    let (macd_line, _, _) = calculate_macd(
        &closes,
        MACD_FAST_PERIOD,
        MACD_SLOW_PERIOD,
        MACD_SIGNAL_PERIOD,
    );
    let macd = if closes.len() > MACD_SLOW_PERIOD {
        macd_line.last().copied().unwrap_or(0.0)
    } else {
        0.0
    };
    let bollinger = latest_bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV)
        .unwrap_or(BollingerBands {
            upper: last.close,
            middle: last.close,
            lower: last.close,
        });

    Some(TechnicalSnapshot {
        rsi,
        macd,
        volatility: return_volatility(&closes, VOLATILITY_LOOKBACK),
        stochastic_k: latest_stochastic_k(candles, STOCHASTIC_PERIOD).unwrap_or(50.0),
        bollinger,
        volume: last.volume_shares as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(idx, &close)| Candle {
                ticker: "SPY".to_string(),
                date: start + Duration::minutes(idx as i64),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume_shares: 1_000 + idx as i64,
            })
            .collect()
    }

    #[test]
    fn rsi_is_extreme_for_monotonic_series() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(*calculate_rsi(&rising, 14).last().unwrap(), 100.0);
        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        assert_eq!(*calculate_rsi(&falling, 14).last().unwrap(), 0.0);
        assert_eq!(calculate_rsi(&rising[..5], 14), vec![50.0; 5]);
    }

    #[test]
    fn bollinger_uses_trailing_window() {
        let mut prices = vec![1_000.0; 10];
        prices.extend(vec![10.0; 20]);
        let bands = latest_bollinger_bands(&prices, 20, 2.0).unwrap();
        assert_eq!(bands.middle, 10.0);
        assert_eq!(bands.upper, 10.0);
        assert_eq!(bands.lower, 10.0);
    }

    #[test]
    fn stochastic_tracks_position_in_range() {
        let candles = candles_from_closes(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        // lowest low 9.5, highest high 14.5, close 14
        let k = latest_stochastic_k(&candles, 14).unwrap();
        assert!((k - 90.0).abs() < 1e-9);
        assert!(latest_stochastic_k(&[], 14).is_none());
    }

    #[test]
    fn volatility_of_constant_growth_is_zero() {
        let prices: Vec<f64> = (0..10).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        assert!(return_volatility(&prices, 20) < 1e-12);
        assert_eq!(return_volatility(&[100.0], 20), 0.0);
    }

    #[test]
    fn snapshot_from_short_history_is_neutral_and_well_formed() {
        let candles = candles_from_closes(&[50.0, 50.0]);
        let snapshot = snapshot_from_candles(&candles).unwrap();
        assert_eq!(snapshot.rsi, 50.0);
        assert_eq!(snapshot.macd, 0.0);
        assert_eq!(snapshot.volume, 1_001.0);
        assert!(snapshot.is_well_formed());
        assert!(snapshot_from_candles(&[]).is_none());
    }

    #[test]
    fn snapshot_from_uptrend_reads_bullish() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.5).collect();
        let snapshot = snapshot_from_candles(&candles_from_closes(&closes)).unwrap();
        assert!(snapshot.rsi > 70.0);
        assert!(snapshot.macd > 0.0);
        assert!(snapshot.stochastic_k > 50.0);
        assert!(snapshot.bollinger.upper > snapshot.bollinger.lower);
        assert!(snapshot.is_well_formed());
    }
}
