//! In-memory asset network.
//!
//! Behaves like the real network for the operations the core uses: accounts
//! must exist, receivers need a trustline, senders need a balance. Transfers
//! to the issuer burn; transfers from the issuer mint. Tests can count calls,
//! inject failures and hook into successful calls.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use log::debug;
use rust_decimal::Decimal;

use crate::core::money::{AssetCode, NetworkAmount};
use crate::network::{AssetNetwork, NetworkError, TxRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    CreateAccount,
    EstablishTrustline,
    Transfer,
    Balance,
}

enum Injected {
    /// Fail without applying the call.
    Fail(NetworkError),
    /// Apply the call, then report a timeout.
    LoseResponse,
}

#[derive(Default)]
struct Ledger {
    /// Native reserve per account.
    accounts: BTreeMap<String, Decimal>,
    trustlines: BTreeSet<(String, AssetCode)>,
    balances: BTreeMap<(String, AssetCode), Decimal>,
    burned: BTreeMap<AssetCode, Decimal>,
    calls: BTreeMap<Operation, u64>,
    injected: BTreeMap<Operation, VecDeque<Injected>>,
    last_ref: Option<TxRef>,
    next_tx: u64,
}

impl Ledger {
    fn issue_ref(&mut self) -> TxRef {
        self.next_tx += 1;
        let tx_ref = TxRef::new(format!("SIM-{:08}", self.next_tx));
        self.last_ref = Some(tx_ref.clone());
        tx_ref
    }
}

type SuccessHook = Box<dyn Fn(Operation, &TxRef) + Send + Sync>;

pub struct SimulatedNetwork {
    issuer: String,
    state: Mutex<Ledger>,
    hook: Mutex<Option<SuccessHook>>,
}

impl SimulatedNetwork {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            state: Mutex::new(Ledger::default()),
            hook: Mutex::new(None),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Number of times `op` was invoked, failed calls included.
    pub fn calls(&self, op: Operation) -> u64 {
        self.ledger().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next `op` fail with `err` without taking effect.
    pub fn fail_next(&self, op: Operation, err: NetworkError) {
        self.ledger()
            .injected
            .entry(op)
            .or_default()
            .push_back(Injected::Fail(err));
    }

    /// Make the next `op` take effect but report a timeout.
    pub fn lose_next_response(&self, op: Operation) {
        self.ledger()
            .injected
            .entry(op)
            .or_default()
            .push_back(Injected::LoseResponse);
    }

    /// Run `hook` after every successful call, outside the network's lock.
    pub fn after_success(&self, hook: impl Fn(Operation, &TxRef) + Send + Sync + 'static) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Reference of the last call that took effect.
    pub fn last_tx_ref(&self) -> Option<TxRef> {
        self.ledger().last_ref.clone()
    }

    /// Total of `asset` sent back to the issuer.
    pub fn burned(&self, asset: &AssetCode) -> Decimal {
        self.ledger().burned.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    /// Credit `amount` of `asset` without a transfer. Not counted as a call.
    pub fn fund(&self, address: &str, asset: &AssetCode, amount: Decimal) -> Result<(), NetworkError> {
        let mut ledger = self.ledger();
        if !ledger.trustlines.contains(&(address.to_string(), asset.clone())) {
            return Err(NetworkError::NoTrustline {
                address: address.to_string(),
                asset: asset.to_string(),
            });
        }
        *ledger
            .balances
            .entry((address.to_string(), asset.clone()))
            .or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, apply it unless a failure is queued, then fire the hook.
    fn invoke<T>(
        &self,
        op: Operation,
        apply: impl FnOnce(&mut Ledger) -> Result<T, NetworkError>,
        tx_ref_of: impl Fn(&T) -> Option<TxRef>,
    ) -> Result<T, NetworkError> {
        let result = {
            let mut ledger = self.ledger();
            *ledger.calls.entry(op).or_insert(0) += 1;
            let injected = ledger.injected.get_mut(&op).and_then(VecDeque::pop_front);
            match injected {
                Some(Injected::Fail(err)) => return Err(err),
                Some(Injected::LoseResponse) => {
                    apply(&mut *ledger)?;
                    return Err(NetworkError::Timeout {
                        operation: operation_name(op),
                    });
                }
                None => apply(&mut *ledger)?,
            }
        };
        if let Some(tx_ref) = tx_ref_of(&result) {
            debug!("Simulated {:?} accepted as {}", op, tx_ref);
            if let Some(hook) = self.hook.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                hook(op, &tx_ref);
            }
        }
        Ok(result)
    }

    fn is_issuer(&self, address: &str) -> bool {
        address == self.issuer
    }
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::CreateAccount => "create_account",
        Operation::EstablishTrustline => "establish_trustline",
        Operation::Transfer => "transfer",
        Operation::Balance => "balance",
    }
}

impl AssetNetwork for SimulatedNetwork {
    fn create_account(&self, address: &str, starting_reserve: &NetworkAmount) -> Result<TxRef, NetworkError> {
        self.invoke(
            Operation::CreateAccount,
            |ledger| {
                if ledger.accounts.contains_key(address) {
                    return Err(NetworkError::AlreadyExists {
                        what: "account",
                        address: address.to_string(),
                    });
                }
                ledger.accounts.insert(address.to_string(), starting_reserve.value());
                Ok(ledger.issue_ref())
            },
            |tx_ref| Some(tx_ref.clone()),
        )
    }

    fn establish_trustline(&self, address: &str, asset: &AssetCode, issuer: &str) -> Result<TxRef, NetworkError> {
        let known_issuer = self.is_issuer(issuer);
        self.invoke(
            Operation::EstablishTrustline,
            |ledger| {
                if !known_issuer {
                    return Err(NetworkError::NoAccount(issuer.to_string()));
                }
                if !ledger.accounts.contains_key(address) {
                    return Err(NetworkError::NoAccount(address.to_string()));
                }
                if !ledger.trustlines.insert((address.to_string(), asset.clone())) {
                    return Err(NetworkError::AlreadyExists {
                        what: "trustline",
                        address: address.to_string(),
                    });
                }
                Ok(ledger.issue_ref())
            },
            |tx_ref| Some(tx_ref.clone()),
        )
    }

    fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &AssetCode,
        amount: &NetworkAmount,
    ) -> Result<TxRef, NetworkError> {
        let mint = self.is_issuer(from);
        let burn = self.is_issuer(to);
        self.invoke(
            Operation::Transfer,
            |ledger| {
                for address in [from, to] {
                    if !self.is_issuer(address) && !ledger.accounts.contains_key(address) {
                        return Err(NetworkError::NoAccount(address.to_string()));
                    }
                }
                if !burn && !ledger.trustlines.contains(&(to.to_string(), asset.clone())) {
                    return Err(NetworkError::NoTrustline {
                        address: to.to_string(),
                        asset: asset.to_string(),
                    });
                }
                let value = amount.value();
                if !mint {
                    let key = (from.to_string(), asset.clone());
                    let held = ledger.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
                    if held < value {
                        return Err(NetworkError::Underfunded(from.to_string()));
                    }
                    ledger.balances.insert(key, held - value);
                }
                if burn {
                    *ledger.burned.entry(asset.clone()).or_insert(Decimal::ZERO) += value;
                } else {
                    *ledger
                        .balances
                        .entry((to.to_string(), asset.clone()))
                        .or_insert(Decimal::ZERO) += value;
                }
                Ok(ledger.issue_ref())
            },
            |tx_ref| Some(tx_ref.clone()),
        )
    }

    fn balance(&self, address: &str, asset: &AssetCode) -> Result<Decimal, NetworkError> {
        self.invoke(
            Operation::Balance,
            |ledger| {
                if !ledger.accounts.contains_key(address) {
                    return Err(NetworkError::NoAccount(address.to_string()));
                }
                let key = (address.to_string(), asset.clone());
                if !ledger.trustlines.contains(&key) {
                    return Err(NetworkError::NoTrustline {
                        address: address.to_string(),
                        asset: asset.to_string(),
                    });
                }
                Ok(ledger.balances.get(&key).copied().unwrap_or(Decimal::ZERO))
            },
            |_| None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn open(network: &SimulatedNetwork, address: &str, asset: &AssetCode) {
        network
            .create_account(address, &NetworkAmount::new(dec!(2)).unwrap())
            .unwrap();
        network.establish_trustline(address, asset, "GISSUER").unwrap();
    }

    #[test]
    fn test_transfer_moves_balance() {
        let network = SimulatedNetwork::new("GISSUER");
        let asset = AssetCode::new("NGNTS");
        open(&network, "GA", &asset);
        open(&network, "GB", &asset);
        network.fund("GA", &asset, dec!(100)).unwrap();

        network
            .transfer("GA", "GB", &asset, &NetworkAmount::new(dec!(40)).unwrap())
            .unwrap();
        assert_eq!(network.balance("GA", &asset).unwrap(), dec!(60));
        assert_eq!(network.balance("GB", &asset).unwrap(), dec!(40));
    }

    #[test]
    fn test_transfer_to_issuer_burns() {
        let network = SimulatedNetwork::new("GISSUER");
        let asset = AssetCode::new("NGNTS");
        open(&network, "GA", &asset);
        network.fund("GA", &asset, dec!(100)).unwrap();
        network
            .transfer("GA", "GISSUER", &asset, &NetworkAmount::new(dec!(25)).unwrap())
            .unwrap();
        assert_eq!(network.burned(&asset), dec!(25));
    }

    #[test]
    fn test_underfunded_and_missing_trustline() {
        let network = SimulatedNetwork::new("GISSUER");
        let asset = AssetCode::new("NGNTS");
        open(&network, "GA", &asset);
        network
            .create_account("GB", &NetworkAmount::new(dec!(2)).unwrap())
            .unwrap();
        let one = NetworkAmount::new(dec!(1)).unwrap();
        assert!(matches!(
            network.transfer("GA", "GB", &asset, &one),
            Err(NetworkError::NoTrustline { .. })
        ));
        network.establish_trustline("GB", &asset, "GISSUER").unwrap();
        assert!(matches!(
            network.transfer("GA", "GB", &asset, &one),
            Err(NetworkError::Underfunded(_))
        ));
    }

    #[test]
    fn test_injected_failures_and_counters() {
        let network = SimulatedNetwork::new("GISSUER");
        network.fail_next(Operation::CreateAccount, NetworkError::LimitExceeded);
        let reserve = NetworkAmount::new(dec!(2)).unwrap();
        assert_eq!(network.create_account("GA", &reserve), Err(NetworkError::LimitExceeded));
        assert!(network.create_account("GA", &reserve).is_ok());
        assert!(network.create_account("GA", &reserve).unwrap_err().is_already_exists());
        assert_eq!(network.calls(Operation::CreateAccount), 3);
    }

    #[test]
    fn test_lost_response_still_applies() {
        let network = SimulatedNetwork::new("GISSUER");
        network.lose_next_response(Operation::CreateAccount);
        let reserve = NetworkAmount::new(dec!(2)).unwrap();
        let err = network.create_account("GA", &reserve).unwrap_err();
        assert!(!err.is_definite());
        assert!(network.last_tx_ref().is_some());
        assert!(network.create_account("GA", &reserve).unwrap_err().is_already_exists());
    }

    #[test]
    fn test_hook_fires_on_success_only() {
        let network = SimulatedNetwork::new("GISSUER");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        network.after_success(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let reserve = NetworkAmount::new(dec!(2)).unwrap();
        network.create_account("GA", &reserve).unwrap();
        let _ = network.create_account("GA", &reserve);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
