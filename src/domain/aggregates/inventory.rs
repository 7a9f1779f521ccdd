//! Inventory Item Aggregate

use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InventoryItem {
    pub id: i64,
    pub name: String,
    quantity_on_hand: u32,
    pub unit_price: Decimal,
}

impl InventoryItem {
    pub fn new(id: i64, name: impl Into<String>, quantity_on_hand: u32, unit_price: Decimal) -> Self {
        Self { id, name: name.into(), quantity_on_hand, unit_price }
    }

    pub fn quantity_on_hand(&self) -> u32 { self.quantity_on_hand }
    pub fn can_supply(&self, qty: u32) -> bool { self.quantity_on_hand >= qty }

    pub fn restock(&mut self, qty: u32) { self.quantity_on_hand = self.quantity_on_hand.saturating_add(qty); }

    pub fn take(&mut self, qty: u32) -> Result<(), InventoryError> {
        self.quantity_on_hand = self.quantity_on_hand.checked_sub(qty).ok_or(InventoryError::Insufficient { available: self.quantity_on_hand })?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum InventoryError { Insufficient { available: u32 } }
impl std::error::Error for InventoryError {}
impl std::fmt::Display for InventoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self { Self::Insufficient { available } => write!(f, "Insufficient stock, {available} available") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_inventory() {
        let mut item = InventoryItem::new(7, "Amoxicillin 500mg", 10, Decimal::new(1250, 2));
        item.take(4).unwrap();
        assert_eq!(item.quantity_on_hand(), 6);
        assert_eq!(item.take(7), Err(InventoryError::Insufficient { available: 6 }));
        assert_eq!(item.quantity_on_hand(), 6);
        item.restock(4);
        assert_eq!(item.quantity_on_hand(), 10);
    }
}
