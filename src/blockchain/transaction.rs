use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Errors that can occur when building a transaction
#[derive(Debug, Error, PartialEq)]
pub enum TransactionError {
    #[error("Sender address must not be empty")]
    EmptySender,

    #[error("Recipient address must not be empty")]
    EmptyRecipient,

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),
}

/// Represents a transfer waiting for, or committed to, a block
///
/// The ledger layer does not track balances, so no solvency or
/// double-spend check happens here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Sender's address
    pub sender: String,

    /// Recipient's address
    pub recipient: String,

    /// Amount being transferred
    pub amount: f64,
}

impl Transaction {
    /// Creates a new transaction
    ///
    /// # Arguments
    ///
    /// * `sender` - The address of the sender
    /// * `recipient` - The address of the recipient
    /// * `amount` - The amount to transfer
    ///
    /// # Returns
    ///
    /// A new Transaction, or an error if an address is blank or the
    /// amount cannot be encoded
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: f64,
    ) -> Result<Self, TransactionError> {
        let transaction = Transaction {
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
        };
        transaction.validate()?;
        Ok(transaction)
    }

    /// Checks the structural constraints of the transaction
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.sender.trim().is_empty() {
            return Err(TransactionError::EmptySender);
        }

        if self.recipient.trim().is_empty() {
            return Err(TransactionError::EmptyRecipient);
        }

        // NaN and infinities have no JSON form, so they could never be hashed
        if !self.amount.is_finite() {
            return Err(TransactionError::InvalidAmount(self.amount));
        }

        Ok(())
    }
}
