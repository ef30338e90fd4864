//! Collaborator seams the engine consumes but does not own.
//!
//! Card and category management and the ledger proper live outside the
//! engine; these traits pin down exactly what the engine needs from them.

use async_trait::async_trait;
use shared::{Card, LedgerTransaction};

use crate::error::EngineResult;

/// Card lookup with ownership folded in: a card belonging to another user
/// is indistinguishable from a missing card.
#[async_trait]
pub trait CardStore: Send + Sync {
    /// Fetch a card by id, returning it only when owned by `user_id`.
    /// The returned card carries its current stored balance.
    async fn get_owned_card(&self, user_id: &str, card_id: &str) -> EngineResult<Option<Card>>;
}

/// Category ownership check.
#[async_trait]
pub trait CategoryStore: Send + Sync {
    async fn owns_category(&self, user_id: &str, category_id: &str) -> EngineResult<bool>;
}

/// Ledger writer: inserts a committed transaction and refreshes the card's
/// stored balance in the same unit of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert the transaction and recompute the card balance as the full
    /// signed sum over the card's ledger transactions, never an increment.
    /// Returns the refreshed balance.
    async fn insert_and_rebalance(&self, transaction: &LedgerTransaction) -> EngineResult<f64>;
}
