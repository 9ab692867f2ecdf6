use error_stack::{Report, bail};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices, round_output};
use crate::model::DailyPoint;

/// RSI (Relative Strength Index) using Wilder's smoothing method.
pub struct Rsi {
    period: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RsiOutput {
    pub rsi: Decimal,
    pub avg_gain: Decimal,
    pub avg_loss: Decimal,
    pub period: usize,
    /// Requested window the series was reduced over, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Rsi {
    type Output = RsiOutput;

    fn name(&self) -> &str {
        "rsi"
    }

    fn required_points(&self) -> usize {
        self.period + 1
    }

    fn compute(&self, series: &[DailyPoint]) -> Option<RsiOutput> {
        let prices = close_prices(series);
        if prices.len() < self.required_points() {
            return None;
        }

        let changes: Vec<Decimal> = prices.windows(2).map(|w| w[1] - w[0]).collect();
        let gain = |d: Decimal| d.max(Decimal::ZERO);
        let loss = |d: Decimal| (-d).max(Decimal::ZERO);
        let period = Decimal::from(self.period);

        // Seed with the simple mean of the first `period` changes
        let (seed, rest) = changes.split_at(self.period);
        let mut avg_gain = seed.iter().copied().map(gain).sum::<Decimal>() / period;
        let mut avg_loss = seed.iter().copied().map(loss).sum::<Decimal>() / period;

        let alpha = Decimal::ONE / period;
        let keep = Decimal::ONE - alpha;
        for &change in rest {
            avg_gain = avg_gain * keep + gain(change) * alpha;
            avg_loss = avg_loss * keep + loss(change) * alpha;
        }

        Some(RsiOutput {
            rsi: round_output(rsi_value(avg_gain, avg_loss)),
            avg_gain: round_output(avg_gain),
            avg_loss: round_output(avg_loss),
            period: self.period,
            days: None,
        })
    }
}

fn rsi_value(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss.is_zero() {
        return dec!(100);
    }
    let rs = avg_gain / avg_loss;
    dec!(100) - dec!(100) / (Decimal::ONE + rs)
}
