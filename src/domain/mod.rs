//! Domain model: orders, payment transactions, inventory
pub mod aggregates;
pub mod events;
pub mod value_objects;
