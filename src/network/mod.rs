//! Asset network contract.
//!
//! The core never talks to the network directly; every flow goes through
//! [`AssetNetwork`]. Calls are irreversible once they return a [`TxRef`].
//! A [`NetworkError::Timeout`] means the outcome is unknown: the call may or
//! may not have landed, and callers must not retry it blindly.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::money::{AssetCode, MoneyError, NetworkAmount};
use crate::error::{ErrorClass, ErrorCode};

/// Reference of a transaction accepted by the asset network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(String);

impl TxRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    /// Account or trustline already exists. Safe for provisioning.
    #[error("{what} already exists for {address}")]
    AlreadyExists { what: &'static str, address: String },
    #[error("source account {0} is underfunded")]
    Underfunded(String),
    #[error("account {address} has no trustline for {asset}")]
    NoTrustline { address: String, asset: String },
    #[error("transfer exceeds the destination limit")]
    LimitExceeded,
    #[error("account {0} does not exist")]
    NoAccount(String),
    /// No answer within the deadline; the call may have been applied.
    #[error("{operation} timed out; outcome unknown")]
    Timeout { operation: &'static str },
    #[error("network transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Amount(#[from] MoneyError),
}

impl NetworkError {
    /// The call definitely did not take effect.
    pub fn is_definite(&self) -> bool {
        !matches!(self, NetworkError::Timeout { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, NetworkError::AlreadyExists { .. })
    }
}

impl ErrorCode for NetworkError {
    fn code(&self) -> &'static str {
        match self {
            NetworkError::AlreadyExists { .. } => "NETWORK_ALREADY_EXISTS",
            NetworkError::Underfunded(_) => "NETWORK_UNDERFUNDED",
            NetworkError::NoTrustline { .. } => "NETWORK_NO_TRUSTLINE",
            NetworkError::LimitExceeded => "NETWORK_LIMIT_EXCEEDED",
            NetworkError::NoAccount(_) => "NETWORK_NO_ACCOUNT",
            NetworkError::Timeout { .. } => "NETWORK_TIMEOUT",
            NetworkError::Transport(_) => "NETWORK_ERROR",
            NetworkError::Amount(_) => "INVALID_AMOUNT",
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            NetworkError::Amount(_) => ErrorClass::Validation,
            _ => ErrorClass::ExternalTransient,
        }
    }
}

/// Client of the external asset network.
///
/// Implementations must be safe to call from several workers at once.
pub trait AssetNetwork: Send + Sync {
    /// Create and activate `address` with `starting_reserve` of the native asset.
    fn create_account(
        &self,
        address: &str,
        starting_reserve: &NetworkAmount,
    ) -> Result<TxRef, NetworkError>;

    /// Allow `address` to hold `asset` issued by `issuer`.
    fn establish_trustline(
        &self,
        address: &str,
        asset: &AssetCode,
        issuer: &str,
    ) -> Result<TxRef, NetworkError>;

    /// Move `amount` of `asset` from one account to another.
    fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &AssetCode,
        amount: &NetworkAmount,
    ) -> Result<TxRef, NetworkError>;

    fn balance(&self, address: &str, asset: &AssetCode) -> Result<Decimal, NetworkError>;
}

impl<T: AssetNetwork + ?Sized> AssetNetwork for &T {
    fn create_account(
        &self,
        address: &str,
        starting_reserve: &NetworkAmount,
    ) -> Result<TxRef, NetworkError> {
        (**self).create_account(address, starting_reserve)
    }

    fn establish_trustline(
        &self,
        address: &str,
        asset: &AssetCode,
        issuer: &str,
    ) -> Result<TxRef, NetworkError> {
        (**self).establish_trustline(address, asset, issuer)
    }

    fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &AssetCode,
        amount: &NetworkAmount,
    ) -> Result<TxRef, NetworkError> {
        (**self).transfer(from, to, asset, amount)
    }

    fn balance(&self, address: &str, asset: &AssetCode) -> Result<Decimal, NetworkError> {
        (**self).balance(address, asset)
    }
}
