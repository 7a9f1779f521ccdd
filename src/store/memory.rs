//! In-process store used by tests and `memory://` runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;
use crate::domain::aggregates::{InventoryItem, Order, OrderStatus, PaymentTransaction, TransactionStatus};
use super::{condense, AdvanceOutcome, CancelOutcome, CancelScope, GatewayLogEntry, NewOrder, OrderStore, SettleOutcome, Settlement, SettlementOutcome, StoreError, StoreResult};

#[derive(Default)]
struct State {
    items: HashMap<i64, InventoryItem>,
    orders: HashMap<Uuid, Order>,
    references: HashMap<String, Uuid>,
    /// keyed by order id
    payments: HashMap<Uuid, PaymentTransaction>,
    handles: HashMap<String, Uuid>,
    gateway_log: Vec<GatewayLogEntry>,
}

impl State {
    fn restock(&mut self, order: &Order) {
        for line in &order.items {
            if let Some(item) = self.items.get_mut(&line.item_id) { item.restock(line.quantity); }
        }
    }
}

/// Every operation holds the single state lock for its whole duration,
/// which gives the same atomicity as one database transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_items(items: impl IntoIterator<Item = InventoryItem>) -> Self {
        let store = Self::new();
        for item in items { store.put_item(item); }
        store
    }

    pub fn put_item(&self, item: InventoryItem) { self.state.lock().items.insert(item.id, item); }

    pub fn gateway_log(&self) -> Vec<GatewayLogEntry> { self.state.lock().gateway_log.clone() }

    pub fn order_count(&self) -> usize { self.state.lock().orders.len() }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn place(&self, new: &NewOrder) -> StoreResult<()> {
        let mut state = self.state.lock();
        let reference = new.order.reference.to_string();
        if state.references.contains_key(&reference) { return Err(StoreError::DuplicateReference(reference)); }

        let wanted = condense(&new.order)?;
        for (item_id, qty) in &wanted {
            let item = state.items.get(item_id).ok_or(StoreError::UnknownItem(*item_id))?;
            if !item.can_supply(*qty) {
                return Err(StoreError::InsufficientStock { item_id: *item_id, name: item.name.clone(), requested: *qty, available: item.quantity_on_hand() });
            }
        }
        for (item_id, qty) in &wanted {
            if let Some(item) = state.items.get_mut(item_id) {
                item.take(*qty).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            }
        }

        state.references.insert(reference, new.order.id);
        state.orders.insert(new.order.id, new.order.clone());
        state.payments.insert(new.order.id, new.payment.clone());
        Ok(())
    }

    async fn discard(&self, order_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.payments.get(&order_id) {
            Some(p) if p.status == TransactionStatus::Pending => {}
            _ => return Ok(false),
        }
        let Some(order) = state.orders.remove(&order_id) else { return Ok(false) };
        if let Some(payment) = state.payments.remove(&order_id) {
            if let Some(handle) = payment.external_reference { state.handles.remove(&handle); }
        }
        state.references.remove(order.reference.as_str());
        state.restock(&order);
        Ok(true)
    }

    async fn attach_handle(&self, payment_id: Uuid, handle: &str, simulated: bool, raw: &Value) -> StoreResult<()> {
        let mut state = self.state.lock();
        let payment = state
            .payments
            .values_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| StoreError::Corrupt(format!("payment {payment_id} missing")))?;
        payment.external_reference = Some(handle.to_string());
        payment.simulated = simulated;
        payment.raw_response = Some(raw.clone());
        let order_id = payment.order_id;
        state.handles.insert(handle.to_string(), order_id);
        Ok(())
    }

    async fn adopt_handle(&self, payment_id: Uuid, handle: &str, simulated: bool) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.handles.contains_key(handle) { return Ok(false); }
        let Some(payment) = state
            .payments
            .values_mut()
            .find(|p| p.id == payment_id && p.status == TransactionStatus::Pending && p.external_reference.is_none())
        else {
            return Ok(false);
        };
        payment.external_reference = Some(handle.to_string());
        payment.simulated = simulated;
        let order_id = payment.order_id;
        state.handles.insert(handle.to_string(), order_id);
        Ok(true)
    }

    async fn order_by_reference(&self, reference: &str) -> StoreResult<Option<Order>> {
        let state = self.state.lock();
        Ok(state.references.get(reference).and_then(|id| state.orders.get(id)).cloned())
    }

    async fn payment_for_order(&self, order_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        Ok(self.state.lock().payments.get(&order_id).cloned())
    }

    async fn payment_by_handle(&self, handle: &str) -> StoreResult<Option<PaymentTransaction>> {
        let state = self.state.lock();
        Ok(state.handles.get(handle).and_then(|id| state.payments.get(id)).cloned())
    }

    async fn settle(&self, handle: &str, settlement: &Settlement) -> StoreResult<SettleOutcome> {
        let mut state = self.state.lock();
        let Some(order_id) = state.handles.get(handle).copied() else { return Ok(SettleOutcome::Unknown) };
        let (Some(mut payment), Some(mut order)) = (state.payments.get(&order_id).cloned(), state.orders.get(&order_id).cloned()) else {
            return Ok(SettleOutcome::Unknown);
        };

        let applied = match &settlement.outcome {
            SettlementOutcome::Success { receipt } => payment.complete(receipt.clone(), settlement.raw.clone()),
            SettlementOutcome::Failure { reason } => payment.fail(reason.clone(), settlement.raw.clone()),
        };
        if applied.is_err() { return Ok(SettleOutcome::AlreadySettled { payment }); }

        let flipped = match &settlement.outcome {
            SettlementOutcome::Success { .. } => order.confirm_payment(settlement.note.clone()),
            SettlementOutcome::Failure { .. } => order.fail_payment(settlement.note.clone()),
        };
        flipped.map_err(|e| StoreError::Corrupt(format!("order {}: {e}", order.reference)))?;

        if matches!(settlement.outcome, SettlementOutcome::Failure { .. }) { state.restock(&order); }
        state.payments.insert(order_id, payment.clone());
        state.orders.insert(order_id, order.clone());
        Ok(SettleOutcome::Applied { order, payment })
    }

    async fn cancel(&self, reference: &str, reason: &str, scope: CancelScope) -> StoreResult<CancelOutcome> {
        let mut state = self.state.lock();
        let Some(order_id) = state.references.get(reference).copied() else { return Ok(CancelOutcome::NotFound) };
        let Some(mut order) = state.orders.get(&order_id).cloned() else { return Ok(CancelOutcome::NotFound) };
        if order.status.is_terminal() { return Ok(CancelOutcome::AlreadyTerminal { order }); }

        let mut payment = state.payments.get(&order_id).cloned().ok_or_else(|| StoreError::Corrupt(format!("order {reference} has no payment")))?;
        let in_scope = match scope {
            CancelScope::Unpaid => order.status == OrderStatus::PaymentPending && payment.cancel(reason).is_ok(),
            CancelScope::Paid => matches!(order.status, OrderStatus::Confirmed | OrderStatus::Processing),
        };
        if !in_scope { return Ok(CancelOutcome::Rejected { order }); }
        order.cancel(format!("Order cancelled: {reason}")).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        state.restock(&order);
        state.payments.insert(order_id, payment);
        state.orders.insert(order_id, order.clone());
        Ok(CancelOutcome::Cancelled { order })
    }

    async fn advance(&self, reference: &str, to: OrderStatus) -> StoreResult<AdvanceOutcome> {
        let mut state = self.state.lock();
        let Some(order_id) = state.references.get(reference).copied() else { return Ok(AdvanceOutcome::NotFound) };
        let Some(order) = state.orders.get_mut(&order_id) else { return Ok(AdvanceOutcome::NotFound) };
        let mut next = order.clone();
        if next.advance(to).is_err() { return Ok(AdvanceOutcome::Rejected { order: next }); }
        *order = next.clone();
        Ok(AdvanceOutcome::Advanced { order: next })
    }

    async fn inventory_item(&self, id: i64) -> StoreResult<Option<InventoryItem>> {
        Ok(self.state.lock().items.get(&id).cloned())
    }

    async fn log_gateway_event(&self, entry: &GatewayLogEntry) -> StoreResult<()> {
        self.state.lock().gateway_log.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{CustomerSnapshot, LineItem, PaymentProvider};
    use crate::domain::value_objects::{OrderReference, PhoneNumber};
    use rust_decimal::Decimal;

    fn new_order(reference: &str, lines: Vec<LineItem>) -> NewOrder {
        let customer = CustomerSnapshot { name: "Otieno".into(), phone: PhoneNumber::parse("0722000111").unwrap(), email: None, address: "Kisumu".into() };
        let order = Order::create(OrderReference::from(reference.to_string()), customer, lines, "KES", PaymentProvider::Mpesa).unwrap();
        let payment = PaymentTransaction::pending(order.id, order.total.amount(), "KES", PaymentProvider::Mpesa);
        NewOrder { order, payment }
    }

    fn line(item_id: i64, quantity: u32, price: i64) -> LineItem { LineItem::new(item_id, quantity, Decimal::from(price)).unwrap() }

    fn store() -> MemoryStore {
        MemoryStore::with_items([
            InventoryItem::new(1, "Paracetamol", 3, Decimal::from(50)),
            InventoryItem::new(2, "Cetirizine", 10, Decimal::from(80)),
        ])
    }

    async fn qty(store: &MemoryStore, id: i64) -> u32 { store.inventory_item(id).await.unwrap().unwrap().quantity_on_hand() }

    #[tokio::test]
    async fn place_is_all_or_nothing() {
        let store = store();
        let new = new_order("ORD1", vec![line(2, 4, 80), line(1, 5, 50)]);
        let err = store.place(&new).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientStock { item_id: 1, requested: 5, available: 3, .. }));
        assert_eq!(qty(&store, 1).await, 3);
        assert_eq!(qty(&store, 2).await, 10);
        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_lines_are_condensed() {
        let store = store();
        let new = new_order("ORD2", vec![line(1, 2, 50), line(1, 2, 50)]);
        assert!(matches!(store.place(&new).await, Err(StoreError::InsufficientStock { requested: 4, .. })));
    }

    #[tokio::test]
    async fn oversized_quantity_sum_takes_nothing() {
        let store = store();
        let half = 1u32 << 31;
        let new = new_order("ORD6", vec![LineItem::new(1, half, Decimal::new(1, 5)).unwrap(), LineItem::new(1, half, Decimal::new(1, 5)).unwrap()]);
        assert!(matches!(store.place(&new).await, Err(StoreError::QuantityTooLarge { item_id: 1 })));
        assert_eq!(qty(&store, 1).await, 3);
        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn discard_restocks_and_forgets() {
        let store = store();
        let new = new_order("ORD3", vec![line(2, 4, 80)]);
        store.place(&new).await.unwrap();
        assert_eq!(qty(&store, 2).await, 6);
        assert!(store.discard(new.order.id).await.unwrap());
        assert_eq!(qty(&store, 2).await, 10);
        assert!(store.order_by_reference("ORD3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_respects_scope() {
        let store = store();
        let new = new_order("ORD5", vec![line(2, 3, 80)]);
        store.place(&new).await.unwrap();
        store.attach_handle(new.payment.id, "ws_CO_5", false, &Value::Null).await.unwrap();

        assert!(matches!(store.cancel("ORD5", "refund", CancelScope::Paid).await.unwrap(), CancelOutcome::Rejected { .. }));
        let ok = Settlement { outcome: SettlementOutcome::Success { receipt: Some("R5".into()) }, note: "paid".into(), raw: Value::Null };
        store.settle("ws_CO_5", &ok).await.unwrap();

        match store.cancel("ORD5", "changed mind", CancelScope::Unpaid).await.unwrap() {
            CancelOutcome::Rejected { order } => assert_eq!(order.status, OrderStatus::Confirmed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(qty(&store, 2).await, 7);

        assert!(matches!(store.cancel("ORD5", "refund", CancelScope::Paid).await.unwrap(), CancelOutcome::Cancelled { .. }));
        assert_eq!(qty(&store, 2).await, 10);
        assert_eq!(store.payment_by_handle("ws_CO_5").await.unwrap().unwrap().status, TransactionStatus::Completed);
        assert!(matches!(store.cancel("ORD5", "again", CancelScope::Paid).await.unwrap(), CancelOutcome::AlreadyTerminal { .. }));
        assert!(matches!(store.cancel("ORD404", "x", CancelScope::Unpaid).await.unwrap(), CancelOutcome::NotFound));
    }

    #[tokio::test]
    async fn settle_is_compare_and_swap() {
        let store = store();
        let new = new_order("ORD4", vec![line(2, 1, 80)]);
        store.place(&new).await.unwrap();
        store.attach_handle(new.payment.id, "ws_CO_1", false, &Value::Null).await.unwrap();

        let fail = Settlement { outcome: SettlementOutcome::Failure { reason: "Request cancelled by user".into() }, note: "failed".into(), raw: Value::Null };
        assert!(matches!(store.settle("ws_CO_1", &fail).await.unwrap(), SettleOutcome::Applied { .. }));
        let ok = Settlement { outcome: SettlementOutcome::Success { receipt: Some("R1".into()) }, note: "paid".into(), raw: Value::Null };
        match store.settle("ws_CO_1", &ok).await.unwrap() {
            SettleOutcome::AlreadySettled { payment } => assert_eq!(payment.status, TransactionStatus::Failed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(qty(&store, 2).await, 10);
        assert!(matches!(store.settle("nope", &ok).await.unwrap(), SettleOutcome::Unknown));
    }
}
