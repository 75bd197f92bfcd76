use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::{ErrorClass, ErrorCode};

/// Maximum number of fractional digits the asset network accepts.
pub const NETWORK_PRECISION: u32 = 7;

/// Default minor-unit scale for the settlement currency (cents).
pub const DEFAULT_MINOR_UNIT_SCALE: u32 = 2;

/// Code of an asset on the asset network (e.g. the settlement token `NGNTS`).
///
/// # Examples
///
/// ```
/// use settlement_core::core::money::AssetCode;
///
/// let ngnts = AssetCode::new("NGNTS");
/// assert_eq!(ngnts.as_str(), "NGNTS");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetCode(String);

impl AssetCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Errors arising from money conversions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MoneyError {
    #[error("amount {amount} has more than {scale} fractional digits")]
    PrecisionExceeded { amount: Decimal, scale: u32 },
    #[error("amount must be positive, got {0}")]
    NonPositive(Decimal),
    #[error("amount {0} does not fit in minor units")]
    Overflow(Decimal),
    #[error("{0} minor units do not fit in a decimal")]
    UnitsOverflow(i128),
    #[error("minor-unit scale {0} exceeds network precision")]
    InvalidScale(u32),
    #[error("invalid network amount '{0}'")]
    Unparseable(String),
}

impl ErrorCode for MoneyError {
    fn code(&self) -> &'static str {
        match self {
            MoneyError::InvalidScale(_) => "INVALID_SCALE",
            _ => "INVALID_AMOUNT",
        }
    }

    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Convert an exact decimal into integer minor units at `scale`.
///
/// Rejects amounts carrying more precision than the scale instead of
/// rounding them, since a silently rounded total would break conservation.
///
/// ```
/// use settlement_core::core::money::to_minor_units;
/// use rust_decimal_macros::dec;
///
/// assert_eq!(to_minor_units(dec!(1000.01), 2).unwrap(), 100_001);
/// assert!(to_minor_units(dec!(0.001), 2).is_err());
/// ```
pub fn to_minor_units(amount: Decimal, scale: u32) -> Result<i128, MoneyError> {
    if scale > NETWORK_PRECISION {
        return Err(MoneyError::InvalidScale(scale));
    }
    let normalized = amount.normalize();
    if normalized.scale() > scale {
        return Err(MoneyError::PrecisionExceeded { amount, scale });
    }
    let mut rescaled = normalized;
    rescaled.rescale(scale);
    if rescaled.scale() != scale {
        // rescale saturates instead of failing when the mantissa is full
        return Err(MoneyError::Overflow(amount));
    }
    Ok(rescaled.mantissa())
}

/// Convert integer minor units back to a decimal at `scale`.
pub fn from_minor_units(units: i128, scale: u32) -> Result<Decimal, MoneyError> {
    Decimal::try_from_i128_with_scale(units, scale)
        .map_err(|_| MoneyError::UnitsOverflow(units))
}

/// Round an amount down to the minor unit. Used for payouts, where the
/// platform never pays out a fraction it cannot settle.
pub fn floor_to_scale(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, rust_decimal::RoundingStrategy::ToZero)
}

/// A positive amount that is valid on the asset network boundary.
///
/// Renders with exactly [`NETWORK_PRECISION`] fractional digits, which is
/// the string form the network accepts.
///
/// ```
/// use settlement_core::core::money::NetworkAmount;
/// use rust_decimal_macros::dec;
///
/// let amount = NetworkAmount::new(dec!(12.5)).unwrap();
/// assert_eq!(amount.to_string(), "12.5000000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkAmount(Decimal);

impl NetworkAmount {
    pub fn new(amount: Decimal) -> Result<Self, MoneyError> {
        if amount <= Decimal::ZERO {
            return Err(MoneyError::NonPositive(amount));
        }
        if amount.normalize().scale() > NETWORK_PRECISION {
            return Err(MoneyError::PrecisionExceeded {
                amount,
                scale: NETWORK_PRECISION,
            });
        }
        Ok(Self(amount))
    }

    /// Parse the network's string form back into an amount.
    pub fn parse(s: &str) -> Result<Self, MoneyError> {
        let amount: Decimal = s
            .trim()
            .parse()
            .map_err(|_| MoneyError::Unparseable(s.to_string()))?;
        Self::new(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for NetworkAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fixed = self.0;
        fixed.rescale(NETWORK_PRECISION);
        write!(f, "{}", fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_units_round_trip() {
        let units = to_minor_units(dec!(1000.01), 2).unwrap();
        assert_eq!(units, 100_001);
        assert_eq!(from_minor_units(units, 2).unwrap(), dec!(1000.01));
    }

    #[test]
    fn test_minor_units_whole_number() {
        assert_eq!(to_minor_units(dec!(1000), 2).unwrap(), 100_000);
        assert_eq!(to_minor_units(dec!(1000.00), 2).unwrap(), 100_000);
    }

    #[test]
    fn test_minor_units_rejects_sub_cent() {
        let err = to_minor_units(dec!(10.005), 2).unwrap_err();
        assert!(matches!(err, MoneyError::PrecisionExceeded { scale: 2, .. }));
    }

    #[test]
    fn test_trailing_zeros_are_not_precision() {
        assert_eq!(to_minor_units(dec!(10.5000), 2).unwrap(), 1050);
    }

    #[test]
    fn test_network_amount_format() {
        let amount = NetworkAmount::new(dec!(400)).unwrap();
        assert_eq!(amount.to_string(), "400.0000000");
    }

    #[test]
    fn test_network_amount_rejects_eight_digits() {
        assert!(NetworkAmount::new(dec!(0.00000001)).is_err());
        assert!(NetworkAmount::new(dec!(0.0000001)).is_ok());
    }

    #[test]
    fn test_network_amount_rejects_zero() {
        assert_eq!(
            NetworkAmount::new(Decimal::ZERO),
            Err(MoneyError::NonPositive(Decimal::ZERO))
        );
    }

    #[test]
    fn test_network_amount_parse() {
        let amount = NetworkAmount::parse("12.3400000").unwrap();
        assert_eq!(amount.value(), dec!(12.34));
        assert!(NetworkAmount::parse("abc").is_err());
    }

    #[test]
    fn test_floor_to_scale() {
        assert_eq!(floor_to_scale(dec!(10.999), 2), dec!(10.99));
    }
}
