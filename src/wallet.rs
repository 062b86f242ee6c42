use std::sync::{
    Mutex,
    MutexGuard,
    PoisonError,
};

/// Bomb balance as last reported by the monitored bot, adjusted locally for
/// every command we pay for and every payout we parse.
///
/// Every operation takes the same lock, so a `spend` can never interleave with
/// a concurrent `add_balance`/`set_balance`.
#[derive(Debug, Default)]
pub struct Wallet {
    balance: Mutex<i64>,
}

impl Wallet {
    pub fn new(initial: i64) -> Self {
        Self {
            balance: Mutex::new(initial),
        }
    }

    fn lock(&self) -> MutexGuard<'_, i64> {
        self.balance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn balance(&self) -> i64 {
        *self.lock()
    }

    pub fn set_balance(&self, amount: i64) {
        *self.lock() = amount;
    }

    /// Credit paths are unconstrained: a negative delta may take the balance
    /// below zero.
    pub fn add_balance(&self, delta: i64) {
        let mut balance = self.lock();
        *balance = balance.saturating_add(delta);
    }

    /// Deducts `amount` if the balance covers it. Returns `false` and leaves
    /// the balance untouched otherwise.
    pub fn spend(&self, amount: i64) -> bool {
        let mut balance = self.lock();
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        true
    }

    pub fn can_afford(&self, amount: i64) -> bool {
        *self.lock() >= amount
    }
}
