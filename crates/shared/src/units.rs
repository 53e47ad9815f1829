//! Base-unit arithmetic for the contribution token.

use alloy_primitives::U256;

use crate::error::ValidationError;

pub const TOKEN_DECIMALS: u8 = 18;

pub fn unit_scale(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// Floors a base-unit amount to whole tokens.
pub fn whole_units(amount: U256, decimals: u8) -> U256 {
    amount / unit_scale(decimals)
}

/// Whole tokens as `u128`, saturating. Used for display and color scaling.
pub fn whole_units_u128(amount: U256, decimals: u8) -> u128 {
    whole_units(amount, decimals).saturating_to::<u128>()
}

pub fn tokens(whole: u64, decimals: u8) -> U256 {
    U256::from(whole) * unit_scale(decimals)
}

/// Parses a decimal token amount such as `1` or `0.5` into base units.
pub fn parse_units(text: &str, decimals: u8) -> Result<U256, ValidationError> {
    let invalid = || ValidationError::InvalidAmount(text.to_string());
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    if fraction.len() > usize::from(decimals)
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !fraction.bytes().all(|b| b.is_ascii_digit())
        || (whole.is_empty() && fraction.is_empty())
    {
        return Err(invalid());
    }

    let whole = if whole.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(whole, 10).map_err(|_| invalid())?
    };
    let mut padded = fraction.to_string();
    padded.extend(std::iter::repeat('0').take(usize::from(decimals) - fraction.len()));
    let fraction = if padded.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(&padded, 10).map_err(|_| invalid())?
    };

    whole
        .checked_mul(unit_scale(decimals))
        .and_then(|scaled| scaled.checked_add(fraction))
        .ok_or_else(invalid)
}
