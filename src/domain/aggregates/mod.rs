//! Aggregates module
pub mod inventory;
pub mod order;
pub mod payment;

pub use inventory::{InventoryError, InventoryItem};
pub use order::{CustomerSnapshot, LineItem, Order, OrderError, OrderStatus, PaymentStatus};
pub use payment::{PaymentProvider, PaymentTransaction, TransactionError, TransactionStatus};
