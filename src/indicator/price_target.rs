use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::indicator::{Indicator, close_prices, mean, round_output};
use crate::model::DailyPoint;

const CONSERVATIVE_FACTOR: Decimal = dec!(0.382);
const AGGRESSIVE_FACTOR: Decimal = dec!(0.618);

/// Fibonacci extension targets from the latest close over the series range.
pub struct PriceTarget;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceTargetOutput {
    pub current_price: Decimal,
    pub conservative_target: Decimal,
    pub aggressive_target: Decimal,
    pub average_price: Decimal,
}

impl Indicator for PriceTarget {
    type Output = PriceTargetOutput;

    fn name(&self) -> &str {
        "price_target"
    }

    fn required_points(&self) -> usize {
        1
    }

    fn compute(&self, series: &[DailyPoint]) -> Option<PriceTargetOutput> {
        let current = series.last()?.close;
        let average = mean(&close_prices(series))?;
        let high = series.iter().map(|p| p.high).max()?;
        let low = series.iter().map(|p| p.low).min()?;
        let range = high - low;

        Some(PriceTargetOutput {
            current_price: round_output(current),
            conservative_target: round_output(current + CONSERVATIVE_FACTOR * range),
            aggressive_target: round_output(current + AGGRESSIVE_FACTOR * range),
            average_price: round_output(average),
        })
    }
}
