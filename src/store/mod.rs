//! Order, payment and inventory persistence.
//!
//! Every operation on [`OrderStore`] is one atomic unit. Settlement and
//! cancellation compare-and-swap the payment transaction out of `pending`,
//! so the first terminal writer wins and later writers observe the settled
//! row instead of applying their own effect.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::{InventoryItem, Order, OrderStatus, PaymentProvider, PaymentTransaction};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// An order and its payment transaction, written together by `place`.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub order: Order,
    pub payment: PaymentTransaction,
}

#[derive(Clone, Debug)]
pub enum SettlementOutcome {
    Success { receipt: Option<String> },
    Failure { reason: String },
}

#[derive(Clone, Debug)]
pub struct Settlement {
    pub outcome: SettlementOutcome,
    pub note: String,
    pub raw: Value,
}

#[derive(Clone, Debug)]
pub enum SettleOutcome {
    Applied { order: Order, payment: PaymentTransaction },
    /// The transaction was already terminal; nothing was written.
    AlreadySettled { payment: PaymentTransaction },
    Unknown,
}

/// Which orders a cancellation may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelScope {
    /// Only an order still awaiting payment. The payment transaction is
    /// swapped out of `pending`, so a settlement that commits first wins.
    Unpaid,
    /// Only a paid order (confirmed or processing); it is flagged for refund
    /// and the completed transaction is left alone.
    Paid,
}

#[derive(Clone, Debug)]
pub enum CancelOutcome {
    Cancelled { order: Order },
    AlreadyTerminal { order: Order },
    /// The order is live but outside the requested scope.
    Rejected { order: Order },
    NotFound,
}

#[derive(Clone, Debug)]
pub enum AdvanceOutcome {
    Advanced { order: Order },
    Rejected { order: Order },
    NotFound,
}

/// One row of the gateway audit log.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayLogEntry {
    pub provider: PaymentProvider,
    pub operation: &'static str,
    pub order_reference: Option<String>,
    pub handle: Option<String>,
    pub simulated: bool,
    pub raw: Value,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Insufficient stock for {name}: requested {requested}, available {available}")]
    InsufficientStock { item_id: i64, name: String, requested: u32, available: u32 },

    #[error("Unknown inventory item {0}")]
    UnknownItem(i64),

    #[error("Requested quantity of item {item_id} is too large")]
    QuantityTooLarge { item_id: i64 },

    #[error("Order reference {0} already exists")]
    DuplicateReference(String),

    #[error("Inconsistent stored state: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Decrements stock for every line (all or nothing) and inserts the
    /// order, its lines and the pending payment transaction.
    async fn place(&self, new: &NewOrder) -> StoreResult<()>;

    /// Compensates a `place` whose payment never started: restocks and
    /// deletes the rows. Returns false when the payment had already settled.
    async fn discard(&self, order_id: Uuid) -> StoreResult<bool>;

    async fn attach_handle(&self, payment_id: Uuid, handle: &str, simulated: bool, raw: &Value) -> StoreResult<()>;

    /// Gives a handle to a pending transaction that never got one, as after
    /// an initiation timeout. False when it already has a handle or settled.
    async fn adopt_handle(&self, payment_id: Uuid, handle: &str, simulated: bool) -> StoreResult<bool>;

    async fn order_by_reference(&self, reference: &str) -> StoreResult<Option<Order>>;

    async fn payment_for_order(&self, order_id: Uuid) -> StoreResult<Option<PaymentTransaction>>;

    async fn payment_by_handle(&self, handle: &str) -> StoreResult<Option<PaymentTransaction>>;

    /// Moves a pending transaction to completed or failed, flips the order
    /// and restocks on failure.
    async fn settle(&self, handle: &str, settlement: &Settlement) -> StoreResult<SettleOutcome>;

    /// Cancels and restocks an order within `scope`.
    async fn cancel(&self, reference: &str, reason: &str, scope: CancelScope) -> StoreResult<CancelOutcome>;

    async fn advance(&self, reference: &str, to: OrderStatus) -> StoreResult<AdvanceOutcome>;

    async fn inventory_item(&self, id: i64) -> StoreResult<Option<InventoryItem>>;

    async fn log_gateway_event(&self, entry: &GatewayLogEntry) -> StoreResult<()>;
}

/// Largest per-item quantity one order may reserve; stock columns are `INT`.
pub const MAX_ITEM_QUANTITY: u32 = i32::MAX as u32;

/// Sums quantities per item, ordered by item id so concurrent orders lock
/// inventory rows in the same order. Every sum is at most [`MAX_ITEM_QUANTITY`].
pub(crate) fn condense(order: &Order) -> StoreResult<BTreeMap<i64, u32>> {
    let mut condensed = BTreeMap::new();
    for line in &order.items {
        let qty = condensed.entry(line.item_id).or_insert(0u32);
        *qty = qty
            .checked_add(line.quantity)
            .filter(|q| *q <= MAX_ITEM_QUANTITY)
            .ok_or(StoreError::QuantityTooLarge { item_id: line.item_id })?;
    }
    Ok(condensed)
}
