//! Fixed-point money helpers. Amounts are `Decimal` with exactly two
//! fractional digits, rounded half away from zero.

use rust_decimal::{Decimal, RoundingStrategy};

pub const MONEY_SCALE: u32 = 2;

/// Rounds to two decimals and pins the scale, so `200` and `200.0` both
/// become `200.00`.
pub fn money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

/// Canonical text form used in hashes, QR tags and XML.
pub fn format_money(value: Decimal) -> String {
    money(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pins_two_decimals() {
        assert_eq!(format_money(dec!(200)), "200.00");
        assert_eq!(format_money(dec!(30.0)), "30.00");
        assert_eq!(format_money(dec!(0.005)), "0.01");
        assert_eq!(format_money(dec!(2.344)), "2.34");
        assert_eq!(format_money(dec!(-1.005)), "-1.01");
    }
}
