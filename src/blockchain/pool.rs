use std::sync::{Mutex, MutexGuard, PoisonError};

use super::transaction::Transaction;

/// Staging area for transactions that are not yet part of a block
///
/// Insertion order is preserved and duplicates are kept. `drain` swaps the
/// whole list out under the same lock `add_transaction` takes, so every
/// submitted transaction ends up either drained or still pending, exactly once.
#[derive(Debug, Default)]
pub struct TransactionPool {
    pending: Mutex<Vec<Transaction>>,
}

impl TransactionPool {
    /// Creates an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transaction
    ///
    /// # Returns
    ///
    /// The number of pending transactions after the insert
    pub fn add_transaction(&self, transaction: Transaction) -> usize {
        let mut pending = self.lock();
        pending.push(transaction);
        pending.len()
    }

    /// Removes and returns every pending transaction
    pub fn drain(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.lock())
    }

    /// Gets a copy of the pending transactions
    pub fn pending(&self) -> Vec<Transaction> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Transaction>> {
        // A panicked writer can only have left a complete Vec behind
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
