pub mod ma;
pub mod price_target;
pub mod rsi;
pub mod volume;

use chrono::{DateTime, Utc};
use error_stack::Report;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::error::IndicatorError;
use crate::model::DailyPoint;

use ma::{MovingAverages, MovingAveragesOutput};
use price_target::{PriceTarget, PriceTargetOutput};
use rsi::{Rsi, RsiOutput};
use volume::{VolumeTrend, VolumeTrendOutput};

/// Results are rounded to this many places, and only on the way out.
pub const OUTPUT_DECIMAL_PLACES: u32 = 4;

/// A backward-looking computation over a daily series.
///
/// The series must be in ascending date order (oldest first). Computations
/// are pure; `None` means the series cannot support the indicator yet.
pub trait Indicator {
    type Output;

    /// Unique name of this indicator (e.g., "rsi", "moving_averages").
    fn name(&self) -> &str;

    /// Minimum number of points required to produce an output.
    fn required_points(&self) -> usize;

    fn compute(&self, series: &[DailyPoint]) -> Option<Self::Output>;
}

/// Extract close prices from a daily series.
pub fn close_prices(series: &[DailyPoint]) -> Vec<Decimal> {
    series.iter().map(|p| p.close).collect()
}

/// Extract volumes from a daily series.
pub fn volumes(series: &[DailyPoint]) -> Vec<i64> {
    series.iter().map(|p| p.volume).collect()
}

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<Decimal>() / Decimal::from(values.len()))
}

pub(crate) fn round_output(value: Decimal) -> Decimal {
    value.round_dp(OUTPUT_DECIMAL_PLACES)
}

/// The four indicators configured for one request window.
pub struct IndicatorSet {
    moving_averages: MovingAverages,
    price_target: PriceTarget,
    volume_trend: VolumeTrend,
    rsi: Rsi,
}

/// Everything computed for one instrument and window, keyed for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorReport {
    pub symbol: String,
    pub days: u32,
    pub as_of: DateTime<Utc>,
    pub points: usize,
    pub moving_averages: Option<MovingAveragesOutput>,
    pub price_target: Option<PriceTargetOutput>,
    pub volume_trend: Option<VolumeTrendOutput>,
    pub rsi: Option<RsiOutput>,
}

impl IndicatorSet {
    /// The volume average spans the whole requested window (`days` points).
    pub fn new(
        ma_windows: &[usize],
        rsi_period: usize,
        days: u32,
    ) -> Result<Self, Report<IndicatorError>> {
        Ok(Self {
            moving_averages: MovingAverages::new(ma_windows)?,
            price_target: PriceTarget,
            volume_trend: VolumeTrend::new(days as usize)?,
            rsi: Rsi::new(rsi_period)?,
        })
    }

    pub fn report(
        &self,
        symbol: &str,
        days: u32,
        as_of: DateTime<Utc>,
        series: &[DailyPoint],
    ) -> IndicatorReport {
        IndicatorReport {
            symbol: symbol.to_owned(),
            days,
            as_of,
            points: series.len(),
            moving_averages: run(&self.moving_averages, series),
            price_target: run(&self.price_target, series),
            volume_trend: run(&self.volume_trend, series),
            rsi: run(&self.rsi, series).map(|rsi| RsiOutput {
                days: Some(days),
                ..rsi
            }),
        }
    }
}

fn run<I: Indicator>(indicator: &I, series: &[DailyPoint]) -> Option<I::Output> {
    let output = indicator.compute(series);
    if output.is_none() {
        debug!(
            indicator = indicator.name(),
            available = series.len(),
            required = indicator.required_points(),
            "indicator has insufficient or invalid data"
        );
    }
    output
}
