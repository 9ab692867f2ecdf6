use error_stack::{Report, bail};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::IndicatorError;
use crate::indicator::{Indicator, mean, round_output, volumes};
use crate::model::DailyPoint;

/// Latest volume against the trailing average volume.
pub struct VolumeTrend {
    window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeTrendOutput {
    pub avg_volume: Decimal,
    pub latest_volume: i64,
    pub volume_change_percent: Decimal,
}

impl VolumeTrend {
    pub fn new(window: usize) -> Result<Self, Report<IndicatorError>> {
        if window == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "volume window must be > 0".into(),
            });
        }
        Ok(Self { window })
    }
}

impl Indicator for VolumeTrend {
    type Output = VolumeTrendOutput;

    fn name(&self) -> &str {
        "volume_trend"
    }

    fn required_points(&self) -> usize {
        1
    }

    /// Averages over the last `window` points, or all of them when the
    /// series is shorter.
    fn compute(&self, series: &[DailyPoint]) -> Option<VolumeTrendOutput> {
        let all = volumes(series);
        let latest = *all.last()?;
        let trailing: Vec<Decimal> = all[all.len().saturating_sub(self.window)..]
            .iter()
            .map(|&v| Decimal::from(v))
            .collect();
        let average = mean(&trailing)?;

        let latest_dec = Decimal::from(latest);
        let change = if latest_dec > Decimal::ZERO && average > Decimal::ZERO {
            (latest_dec - average) / average * dec!(100)
        } else {
            Decimal::ZERO
        };

        Some(VolumeTrendOutput {
            avg_volume: round_output(average),
            latest_volume: latest,
            volume_change_percent: round_output(change),
        })
    }
}
