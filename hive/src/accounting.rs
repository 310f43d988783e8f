//! Per peer balances for served and consumed chunks, and their prices.
//!
//! Retrieving a chunk credits the serving peer, serving one debits the
//! requesting peer. Both happen in two steps: `prepare_*` reserves the
//! amount and returns an [`Action`], [`Action::apply`] books it. Dropping
//! an action without applying it releases the reservation.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Instant,
};

use hive_base::{Address, MAX_PO};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tracing::trace;

/// Default price of a chunk at maximum proximity.
pub const DEFAULT_BASE_PRICE: u64 = 10_000;
/// Default debt towards a single peer before requests are refused.
pub const DEFAULT_PAYMENT_THRESHOLD: u64 = 13_500_000;
/// Default amount of debt forgiven per second.
pub const DEFAULT_REFRESH_RATE: u64 = 4_500_000;

/// Errors from accounting.
#[allow(missing_docs)]
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AccountingError {
    #[snafu(display("debt to {peer} would exceed the payment threshold"))]
    Overdraft { peer: Address },
}

/// A prepared balance change.
#[derive(derive_more::Debug)]
#[must_use = "an action does nothing unless applied"]
pub struct Action {
    #[debug(skip)]
    apply: Option<Box<dyn FnOnce() + Send>>,
    #[debug(skip)]
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Action {
    /// An action with the given booking and release steps.
    pub fn new(
        apply: impl FnOnce() + Send + 'static,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            apply: Some(Box::new(apply)),
            release: Some(Box::new(release)),
        }
    }

    /// An action that does nothing.
    pub fn noop() -> Self {
        Self {
            apply: None,
            release: None,
        }
    }

    /// Books the change.
    pub fn apply(mut self) {
        self.release = None;
        if let Some(apply) = self.apply.take() {
            apply();
        }
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Keeps balances with peers.
pub trait Accounting: Send + Sync + Debug + 'static {
    /// Prepares crediting `peer` with `price` for a chunk it serves us.
    fn prepare_credit(&self, peer: Address, price: u64, originated: bool) -> Result<Action, AccountingError>;

    /// Prepares debiting `peer` with `price` for a chunk we serve it.
    fn prepare_debit(&self, peer: Address, price: u64) -> Result<Action, AccountingError>;
}

impl<T: Accounting + ?Sized> Accounting for Arc<T> {
    fn prepare_credit(&self, peer: Address, price: u64, originated: bool) -> Result<Action, AccountingError> {
        self.as_ref().prepare_credit(peer, price, originated)
    }

    fn prepare_debit(&self, peer: Address, price: u64) -> Result<Action, AccountingError> {
        self.as_ref().prepare_debit(peer, price)
    }
}

/// Accounting that never refuses and books nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccounting;

impl Accounting for NoAccounting {
    fn prepare_credit(&self, _peer: Address, _price: u64, _originated: bool) -> Result<Action, AccountingError> {
        Ok(Action::noop())
    }

    fn prepare_debit(&self, _peer: Address, _price: u64) -> Result<Action, AccountingError> {
        Ok(Action::noop())
    }
}

/// Configuration of the [`Bookkeeper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookkeeperConfig {
    /// Debt towards a single peer before further credits are refused.
    pub payment_threshold: u64,
    /// Debt forgiven per second, in place of settlements.
    pub refresh_rate: u64,
}

impl Default for BookkeeperConfig {
    fn default() -> Self {
        Self {
            payment_threshold: DEFAULT_PAYMENT_THRESHOLD,
            refresh_rate: DEFAULT_REFRESH_RATE,
        }
    }
}

#[derive(Debug)]
struct PeerBalance {
    /// Positive when the peer owes us.
    balance: i64,
    /// Credit prepared but not yet applied.
    reserved: u64,
    last_refresh: Instant,
}

impl PeerBalance {
    fn new() -> Self {
        Self {
            balance: 0,
            reserved: 0,
            last_refresh: Instant::now(),
        }
    }

    /// Forgives debt accrued since the last refresh, never turning it into
    /// a claim.
    fn refresh(&mut self, rate: u64, now: Instant) {
        let elapsed = now.duration_since(self.last_refresh).as_secs_f64();
        let forgiven = (elapsed * rate as f64) as i64;
        if forgiven > 0 {
            self.last_refresh = now;
            if self.balance < 0 {
                self.balance = (self.balance + forgiven).min(0);
            }
        }
    }
}

/// In memory balances with a payment threshold and time based refresh.
#[derive(Debug, Clone, Default)]
pub struct Bookkeeper {
    inner: Arc<BookkeeperInner>,
}

#[derive(Debug, Default)]
struct BookkeeperInner {
    config: BookkeeperConfig,
    balances: Mutex<HashMap<Address, PeerBalance>>,
}

impl Bookkeeper {
    /// Creates a bookkeeper.
    pub fn new(config: BookkeeperConfig) -> Self {
        Self {
            inner: Arc::new(BookkeeperInner {
                config,
                balances: Default::default(),
            }),
        }
    }

    /// The balance with `peer`, positive when the peer owes us.
    pub fn balance(&self, peer: &Address) -> i64 {
        self.inner
            .balances
            .lock()
            .expect("poisoned")
            .get(peer)
            .map(|b| b.balance)
            .unwrap_or_default()
    }

    /// Credit prepared for `peer` and not yet applied or released.
    pub fn reserved(&self, peer: &Address) -> u64 {
        self.inner
            .balances
            .lock()
            .expect("poisoned")
            .get(peer)
            .map(|b| b.reserved)
            .unwrap_or_default()
    }
}

impl Accounting for Bookkeeper {
    fn prepare_credit(&self, peer: Address, price: u64, originated: bool) -> Result<Action, AccountingError> {
        let config = &self.inner.config;
        {
            let mut balances = self.inner.balances.lock().expect("poisoned");
            let entry = balances.entry(peer).or_insert_with(PeerBalance::new);
            entry.refresh(config.refresh_rate, Instant::now());
            let debt = (-entry.balance).max(0) as u64;
            if debt + entry.reserved + price > config.payment_threshold {
                trace!(peer = %peer.fmt_short(), debt, price, originated, "overdraft");
                return OverdraftSnafu { peer }.fail();
            }
            entry.reserved += price;
        }
        let apply = {
            let inner = self.inner.clone();
            move || {
                let mut balances = inner.balances.lock().expect("poisoned");
                let entry = balances.entry(peer).or_insert_with(PeerBalance::new);
                entry.reserved = entry.reserved.saturating_sub(price);
                entry.balance -= price as i64;
            }
        };
        let release = {
            let inner = self.inner.clone();
            move || {
                let mut balances = inner.balances.lock().expect("poisoned");
                if let Some(entry) = balances.get_mut(&peer) {
                    entry.reserved = entry.reserved.saturating_sub(price);
                }
            }
        };
        Ok(Action::new(apply, release))
    }

    fn prepare_debit(&self, peer: Address, price: u64) -> Result<Action, AccountingError> {
        let inner = self.inner.clone();
        Ok(Action::new(
            move || {
                let mut balances = inner.balances.lock().expect("poisoned");
                let entry = balances.entry(peer).or_insert_with(PeerBalance::new);
                entry.balance += price as i64;
            },
            || {},
        ))
    }
}

/// Prices chunks by proximity: the closer the serving peer is to the chunk,
/// the cheaper.
#[derive(Debug, Clone, Copy)]
pub struct Pricer {
    base: Address,
    base_price: u64,
}

impl Pricer {
    /// A pricer for the node at `base`.
    pub fn new(base: Address, base_price: u64) -> Self {
        Self { base, base_price }
    }

    /// What this node charges for `chunk`.
    pub fn price(&self, chunk: &Address) -> u64 {
        self.peer_price(&self.base, chunk)
    }

    /// What `peer` charges for `chunk`.
    pub fn peer_price(&self, peer: &Address, chunk: &Address) -> u64 {
        let po = peer.bin(chunk) as u64;
        (MAX_PO as u64 - po + 1) * self.base_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices() {
        let pricer = Pricer::new(Address::ZERO, 10);
        assert_eq!(pricer.price(&Address::ZERO), 10);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        assert_eq!(pricer.price(&Address::new(far)), 320);
        far[0] = 0x01;
        assert_eq!(pricer.peer_price(&Address::ZERO, &Address::new(far)), 250);
    }

    #[test]
    fn credit_reserve_apply_release() {
        let book = Bookkeeper::new(BookkeeperConfig {
            payment_threshold: 100,
            refresh_rate: 0,
        });
        let peer = Address::new([1; 32]);

        let a = book.prepare_credit(peer, 60, true).unwrap();
        assert_eq!(book.reserved(&peer), 60);
        assert!(matches!(
            book.prepare_credit(peer, 60, true),
            Err(AccountingError::Overdraft { .. })
        ));
        drop(a);
        assert_eq!(book.reserved(&peer), 0);

        book.prepare_credit(peer, 60, true).unwrap().apply();
        assert_eq!(book.balance(&peer), -60);
        assert_eq!(book.reserved(&peer), 0);
        assert!(book.prepare_credit(peer, 50, true).is_err());

        book.prepare_debit(peer, 30).unwrap().apply();
        assert_eq!(book.balance(&peer), -30);
        assert!(book.prepare_credit(peer, 50, false).is_ok());
    }

    #[test]
    fn debt_is_refreshed() {
        let book = Bookkeeper::new(BookkeeperConfig {
            payment_threshold: 100,
            refresh_rate: 1_000_000,
        });
        let peer = Address::new([1; 32]);
        book.prepare_credit(peer, 100, true).unwrap().apply();
        std::thread::sleep(std::time::Duration::from_millis(5));
        book.prepare_credit(peer, 100, true).unwrap().apply();
    }
}
