use std::collections::BTreeMap;

use error_stack::{Report, bail};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices, round_output};
use crate::model::DailyPoint;

/// Simple moving averages of close over one or more trailing windows.
pub struct MovingAverages {
    windows: Vec<usize>,
}

/// Latest average per window, serialized as `ma_{window}` keys.
#[derive(Debug, Clone, PartialEq)]
pub struct MovingAveragesOutput {
    pub values: BTreeMap<usize, Decimal>,
}

impl MovingAverages {
    pub fn new(windows: &[usize]) -> Result<Self, Report<IndicatorError>> {
        if windows.is_empty() {
            bail!(IndicatorError::InvalidParameter {
                name: "at least one window is required".into(),
            });
        }
        if windows.contains(&0) {
            bail!(IndicatorError::InvalidParameter {
                name: "window must be > 0".into(),
            });
        }
        let mut windows = windows.to_vec();
        windows.sort_unstable();
        windows.dedup();
        Ok(Self { windows })
    }
}

impl Indicator for MovingAverages {
    type Output = MovingAveragesOutput;

    fn name(&self) -> &str {
        "moving_averages"
    }

    fn required_points(&self) -> usize {
        self.windows.iter().copied().max().unwrap_or(0)
    }

    fn compute(&self, series: &[DailyPoint]) -> Option<MovingAveragesOutput> {
        let closes = close_prices(series);
        if closes.len() < self.required_points() {
            return None;
        }

        let mut values = BTreeMap::new();
        for &window in &self.windows {
            let average = rolling_average(&closes, window).pop().flatten()?;
            if average <= Decimal::ZERO {
                return None;
            }
            values.insert(window, round_output(average));
        }
        Some(MovingAveragesOutput { values })
    }
}

impl Serialize for MovingAveragesOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let keyed: BTreeMap<String, Decimal> = self
            .values
            .iter()
            .map(|(window, value)| (format!("ma_{window}"), *value))
            .collect();
        keyed.serialize(serializer)
    }
}

/// Trailing mean at every point; `None` for the first `window - 1` points.
///
/// Unrounded. [`MovingAverages`] reports the last element of this curve.
pub fn rolling_average(values: &[Decimal], window: usize) -> Vec<Option<Decimal>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let divisor = Decimal::from(window);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = Decimal::ZERO;
    for (i, &value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        out.push((i + 1 >= window).then(|| sum / divisor));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    fn series(closes: &[Decimal]) -> Vec<DailyPoint> {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let date = start + Duration::days(i as i64);
                DailyPoint {
                    date,
                    close,
                    high: close,
                    low: close,
                    volume: 100,
                    timestamp_of_record: date.and_hms_opt(21, 0, 0).unwrap().and_utc(),
                }
            })
            .collect()
    }

    #[test]
    fn rejects_empty_or_zero_windows() {
        assert!(MovingAverages::new(&[]).is_err());
        assert!(MovingAverages::new(&[5, 0]).is_err());
    }

    #[test]
    fn averages_trailing_windows_from_latest_point() {
        let closes: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        let ma = MovingAverages::new(&[5, 20]).unwrap();

        let out = ma.compute(&series(&closes)).unwrap();
        assert_eq!(out.values.get(&5).copied(), Some(dec!(18)));
        assert_eq!(out.values.get(&20).copied(), Some(dec!(10.5)));
    }

    #[test]
    fn shorter_than_largest_window_is_none() {
        let closes: Vec<Decimal> = (1..=19).map(Decimal::from).collect();
        let ma = MovingAverages::new(&[5, 20]).unwrap();
        assert_eq!(ma.required_points(), 20);
        assert!(ma.compute(&series(&closes)).is_none());
    }

    #[test]
    fn non_positive_average_is_none() {
        let closes = vec![dec!(0); 5];
        let ma = MovingAverages::new(&[5]).unwrap();
        assert!(ma.compute(&series(&closes)).is_none());
    }

    #[test]
    fn output_rounds_to_four_places() {
        let closes = vec![dec!(1), dec!(1), dec!(2)];
        let ma = MovingAverages::new(&[3]).unwrap();
        let out = ma.compute(&series(&closes)).unwrap();
        assert_eq!(out.values.get(&3).copied(), Some(dec!(1.3333)));
    }

    #[test]
    fn serializes_with_window_keys() {
        let closes: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        let out = MovingAverages::new(&[20, 5])
            .unwrap()
            .compute(&series(&closes))
            .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["ma_5"], serde_json::json!(18.0));
        assert_eq!(json["ma_20"], serde_json::json!(10.5));
    }

    #[test]
    fn rolling_average_is_undefined_before_window_fills() {
        let values = vec![dec!(2), dec!(4), dec!(6), dec!(8)];
        let rolled = rolling_average(&values, 3);
        assert_eq!(rolled, vec![None, None, Some(dec!(4)), Some(dec!(6))]);
    }

    #[test]
    fn rolling_average_last_matches_single_value_form() {
        let closes: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        let rolled = rolling_average(&closes, 5);
        let single = MovingAverages::new(&[5])
            .unwrap()
            .compute(&series(&closes))
            .unwrap();
        assert_eq!(rolled.last().copied().flatten(), single.values.get(&5).copied());
    }
}
