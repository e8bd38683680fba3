//! Price formatting for published messages.

/// Decimal exponent of the lamport.
pub const SOL_DECIMALS: u32 = 9;

/// Amounts below this are not considered meaningfully priced.
pub const DEFAULT_PRICE_THRESHOLD: u64 = 100_000_000;

/// Render `amount` smallest units as a fixed-point decimal with `decimals`
/// fractional digits.
pub fn format_fixed_point(amount: u64, decimals: u32) -> String {
    if decimals == 0 {
        return amount.to_string();
    }

    let digits = format!("{:0>width$}", amount, width = decimals as usize + 1);
    let (integer, fraction) = digits.split_at(digits.len() - decimals as usize);
    format!("{integer}.{fraction}")
}

/// Price as shown to readers, or an empty string below `threshold`.
pub fn to_price_string(amount: u64, threshold: u64) -> String {
    if amount < threshold {
        return String::new();
    }
    format_fixed_point(amount, SOL_DECIMALS)
}
