//! Minor-unit money helpers
//!
//! Every amount in the ledger is an `i64` count of currency minor units
//! (cents). Percentages are integer basis points so that no money path ever
//! touches floating point.

/// Basis points in 100%.
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Minor units per major currency unit.
pub const MINOR_PER_UNIT: i64 = 100;

/// `amount * bps / 10_000`, rounded half-to-even to the nearest minor unit.
pub fn apply_bps(amount: i64, bps: i64) -> i64 {
    div_round_half_even(i128::from(amount) * i128::from(bps), i128::from(BPS_DENOMINATOR)) as i64
}

/// Integer division rounding half-to-even. `den` must be positive.
pub fn div_round_half_even(num: i128, den: i128) -> i128 {
    debug_assert!(den > 0);
    let quotient = num.div_euclid(den);
    let twice_remainder = num.rem_euclid(den) * 2;

    if twice_remainder > den || (twice_remainder == den && quotient.rem_euclid(2) == 1) {
        quotient + 1
    } else {
        quotient
    }
}

/// Render minor units as a plain decimal string, e.g. `12345 -> "123.45"`.
pub fn format_minor(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let unit = MINOR_PER_UNIT as u64;
    format!("{}{}.{:02}", sign, abs / unit, abs % unit)
}
