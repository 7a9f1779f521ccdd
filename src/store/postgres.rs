//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, FromRow, PgConnection, PgPool};
use uuid::Uuid;
use crate::domain::aggregates::{
    CustomerSnapshot, InventoryItem, LineItem, Order, OrderStatus, PaymentProvider, PaymentStatus, PaymentTransaction, TransactionStatus,
};
use crate::domain::value_objects::{Money, OrderReference, PhoneNumber};
use super::{condense, AdvanceOutcome, CancelOutcome, CancelScope, GatewayLogEntry, NewOrder, OrderStore, SettleOutcome, Settlement, SettlementOutcome, StoreError, StoreResult};

const ORDER_COLUMNS: &str = "id, reference, customer_name, customer_phone, customer_email, customer_address, total_amount, currency, payment_method, status, payment_status, notes, created_at, updated_at, completed_at";
const PAYMENT_COLUMNS: &str = "id, order_id, amount, currency, provider, external_reference, receipt, status, failure_reason, raw_response, simulated, created_at, updated_at";

const RESTOCK_ORDER: &str = r#"UPDATE medicines m
       SET quantity_on_hand = m.quantity_on_hand + s.qty, updated_at = now()
       FROM (SELECT medicine_id, SUM(quantity)::INT AS qty FROM order_items WHERE order_id = $1 GROUP BY medicine_id) s
       WHERE m.id = s.medicine_id"#;

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    reference: String,
    customer_name: String,
    customer_phone: String,
    customer_email: Option<String>,
    customer_address: String,
    total_amount: Decimal,
    currency: String,
    payment_method: String,
    status: String,
    payment_status: String,
    notes: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct LineRow { medicine_id: i64, quantity: i32, unit_price: Decimal, line_total: Decimal }

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    amount: Decimal,
    currency: String,
    provider: String,
    external_reference: Option<String>,
    receipt: Option<String>,
    status: String,
    failure_reason: Option<String>,
    raw_response: Option<Value>,
    simulated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn corrupt(what: impl std::fmt::Display) -> StoreError { StoreError::Corrupt(what.to_string()) }

fn stock_quantity(item_id: i64, qty: u32) -> StoreResult<i32> {
    i32::try_from(qty).map_err(|_| StoreError::QuantityTooLarge { item_id })
}

impl TryFrom<PaymentRow> for PaymentTransaction {
    type Error = StoreError;
    fn try_from(r: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            order_id: r.order_id,
            amount: r.amount,
            provider: PaymentProvider::parse(&r.provider).ok_or_else(|| corrupt(format!("payment provider '{}'", r.provider)))?,
            status: TransactionStatus::parse(&r.status).ok_or_else(|| corrupt(format!("payment status '{}'", r.status)))?,
            currency: r.currency,
            external_reference: r.external_reference,
            receipt: r.receipt,
            failure_reason: r.failure_reason,
            raw_response: r.raw_response,
            simulated: r.simulated,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn into_order(r: OrderRow, lines: Vec<LineRow>) -> StoreResult<Order> {
    let items = lines
        .into_iter()
        .map(|l| {
            let quantity = u32::try_from(l.quantity).map_err(|_| corrupt(format!("line quantity {}", l.quantity)))?;
            Ok(LineItem { item_id: l.medicine_id, quantity, unit_price: l.unit_price, line_total: l.line_total })
        })
        .collect::<StoreResult<Vec<_>>>()?;
    Ok(Order {
        id: r.id,
        customer: CustomerSnapshot {
            name: r.customer_name,
            phone: PhoneNumber::parse(&r.customer_phone).map_err(corrupt)?,
            email: r.customer_email,
            address: r.customer_address,
        },
        items,
        total: Money::new(r.total_amount, &r.currency),
        payment_method: PaymentProvider::parse(&r.payment_method).ok_or_else(|| corrupt(format!("payment method '{}'", r.payment_method)))?,
        status: OrderStatus::parse(&r.status).ok_or_else(|| corrupt(format!("order status '{}'", r.status)))?,
        payment_status: PaymentStatus::parse(&r.payment_status).ok_or_else(|| corrupt(format!("payment status '{}'", r.payment_status)))?,
        reference: OrderReference::from(r.reference),
        notes: r.notes,
        created_at: r.created_at,
        updated_at: r.updated_at,
        completed_at: r.completed_at,
    })
}

async fn load_order(conn: &mut PgConnection, id: Uuid) -> StoreResult<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM customer_orders WHERE id = $1");
    let Some(row) = sqlx::query_as::<_, OrderRow>(&sql).bind(id).fetch_optional(&mut *conn).await? else { return Ok(None) };
    let lines = sqlx::query_as::<_, LineRow>(
        "SELECT medicine_id, quantity, unit_price, line_total FROM order_items WHERE order_id = $1 ORDER BY position",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    into_order(row, lines).map(Some)
}

async fn order_id_for(conn: &mut PgConnection, reference: &str) -> StoreResult<Option<Uuid>> {
    Ok(sqlx::query_scalar::<_, Uuid>("SELECT id FROM customer_orders WHERE reference = $1")
        .bind(reference)
        .fetch_optional(&mut *conn)
        .await?)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn place(&self, new: &NewOrder) -> StoreResult<()> {
        let (order, payment) = (&new.order, &new.payment);
        let wanted = condense(order)?;
        let mut tx = self.pool.begin().await?;

        for (item_id, qty) in wanted {
            let taken = sqlx::query_scalar::<_, i64>(
                "UPDATE medicines SET quantity_on_hand = quantity_on_hand - $2, updated_at = now() WHERE id = $1 AND quantity_on_hand >= $2 RETURNING id",
            )
            .bind(item_id)
            .bind(stock_quantity(item_id, qty)?)
            .fetch_optional(&mut *tx)
            .await?;
            if taken.is_none() {
                let current = sqlx::query_as::<_, (String, i32)>("SELECT name, quantity_on_hand FROM medicines WHERE id = $1")
                    .bind(item_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                // dropping tx rolls back the decrements made so far
                return Err(match current {
                    Some((name, available)) => StoreError::InsufficientStock { item_id, name, requested: qty, available: available.max(0) as u32 },
                    None => StoreError::UnknownItem(item_id),
                });
            }
        }

        sqlx::query(
            r#"INSERT INTO customer_orders (id, reference, customer_name, customer_phone, customer_email, customer_address,
                   total_amount, currency, payment_method, status, payment_status, notes, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(order.id)
        .bind(order.reference.as_str())
        .bind(&order.customer.name)
        .bind(order.customer.phone.as_str())
        .bind(order.customer.email.as_deref())
        .bind(&order.customer.address)
        .bind(order.total.amount())
        .bind(order.total.currency())
        .bind(order.payment_method.as_str())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.notes.clone())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::DuplicateReference(order.reference.to_string()),
            other => StoreError::Database(other),
        })?;

        for (position, line) in order.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (order_id, position, medicine_id, quantity, unit_price, line_total) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(order.id)
            .bind(position as i32)
            .bind(line.item_id)
            .bind(stock_quantity(line.item_id, line.quantity)?)
            .bind(line.unit_price)
            .bind(line.line_total)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"INSERT INTO payment_transactions (id, order_id, amount, currency, provider, status, simulated, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(payment.id)
        .bind(payment.order_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.provider.as_str())
        .bind(payment.status.as_str())
        .bind(payment.simulated)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn discard(&self, order_id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM payment_transactions WHERE order_id = $1 AND status = 'pending'")
            .bind(order_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(RESTOCK_ORDER).bind(order_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM customer_orders WHERE id = $1").bind(order_id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn attach_handle(&self, payment_id: Uuid, handle: &str, simulated: bool, raw: &Value) -> StoreResult<()> {
        sqlx::query(
            "UPDATE payment_transactions SET external_reference = $2, simulated = $3, raw_response = $4, updated_at = now() WHERE id = $1",
        )
        .bind(payment_id)
        .bind(handle)
        .bind(simulated)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn adopt_handle(&self, payment_id: Uuid, handle: &str, simulated: bool) -> StoreResult<bool> {
        let adopted = sqlx::query(
            "UPDATE payment_transactions SET external_reference = $2, simulated = $3, updated_at = now() \
             WHERE id = $1 AND external_reference IS NULL AND status = 'pending'",
        )
        .bind(payment_id)
        .bind(handle)
        .bind(simulated)
        .execute(&self.pool)
        .await;
        match adopted {
            Ok(done) => Ok(done.rows_affected() == 1),
            // the handle already belongs to another transaction
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn order_by_reference(&self, reference: &str) -> StoreResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let Some(id) = order_id_for(&mut conn, reference).await? else { return Ok(None) };
        load_order(&mut conn, id).await
    }

    async fn payment_for_order(&self, order_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&sql).bind(order_id).fetch_optional(&self.pool).await?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn payment_by_handle(&self, handle: &str) -> StoreResult<Option<PaymentTransaction>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE external_reference = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&sql).bind(handle).fetch_optional(&self.pool).await?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn settle(&self, handle: &str, settlement: &Settlement) -> StoreResult<SettleOutcome> {
        let (status, receipt, reason) = match &settlement.outcome {
            SettlementOutcome::Success { receipt } => (TransactionStatus::Completed, receipt.as_deref(), None),
            SettlementOutcome::Failure { reason } => (TransactionStatus::Failed, None, Some(reason.as_str())),
        };
        let mut tx = self.pool.begin().await?;

        // Row lock + status guard: a concurrent settle blocks here and then
        // matches nothing once the winner commits.
        let sql = format!(
            "UPDATE payment_transactions SET status = $2, receipt = COALESCE($3, receipt), failure_reason = $4, raw_response = $5, updated_at = now() \
             WHERE external_reference = $1 AND status = 'pending' RETURNING {PAYMENT_COLUMNS}"
        );
        let swapped = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(handle)
            .bind(status.as_str())
            .bind(receipt)
            .bind(reason)
            .bind(&settlement.raw)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = swapped else {
            tx.rollback().await?;
            return Ok(match self.payment_by_handle(handle).await? {
                Some(payment) => SettleOutcome::AlreadySettled { payment },
                None => SettleOutcome::Unknown,
            });
        };
        let payment = PaymentTransaction::try_from(row)?;

        let (order_status, payment_status) = match status {
            TransactionStatus::Completed => (OrderStatus::Confirmed, PaymentStatus::Paid),
            _ => (OrderStatus::Cancelled, PaymentStatus::Failed),
        };
        let flipped = sqlx::query(
            "UPDATE customer_orders SET status = $2, payment_status = $3, notes = array_append(notes, $4), updated_at = now() WHERE id = $1 AND status = 'payment_pending'",
        )
        .bind(payment.order_id)
        .bind(order_status.as_str())
        .bind(payment_status.as_str())
        .bind(&settlement.note)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if flipped != 1 {
            return Err(corrupt(format!("order {} not awaiting payment", payment.order_id)));
        }
        if order_status == OrderStatus::Cancelled {
            sqlx::query(RESTOCK_ORDER).bind(payment.order_id).execute(&mut *tx).await?;
        }

        let order = load_order(&mut tx, payment.order_id).await?.ok_or_else(|| corrupt(format!("order {} vanished", payment.order_id)))?;
        tx.commit().await?;
        Ok(SettleOutcome::Applied { order, payment })
    }

    async fn cancel(&self, reference: &str, reason: &str, scope: CancelScope) -> StoreResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(order_id) = order_id_for(&mut tx, reference).await? else { return Ok(CancelOutcome::NotFound) };
        let note = format!("Order cancelled: {reason}");

        let cancelled = match scope {
            CancelScope::Unpaid => {
                // Payment row first, the same lock order as settle. A settle
                // that committed first leaves nothing pending to swap.
                let swapped = sqlx::query(
                    "UPDATE payment_transactions SET status = 'cancelled', failure_reason = $2, updated_at = now() WHERE order_id = $1 AND status = 'pending'",
                )
                .bind(order_id)
                .bind(reason)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    == 1;
                swapped
                    && sqlx::query(
                        "UPDATE customer_orders SET status = 'cancelled', payment_status = 'failed', notes = array_append(notes, $2), updated_at = now() \
                         WHERE id = $1 AND status = 'payment_pending'",
                    )
                    .bind(order_id)
                    .bind(&note)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                        == 1
            }
            CancelScope::Paid => {
                sqlx::query(
                    "UPDATE customer_orders SET status = 'cancelled', payment_status = 'refunded', notes = array_append(notes, $2), updated_at = now() \
                     WHERE id = $1 AND status IN ('confirmed', 'processing')",
                )
                .bind(order_id)
                .bind(&note)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    == 1
            }
        };

        if !cancelled {
            let order = load_order(&mut tx, order_id).await?.ok_or_else(|| corrupt(format!("order {reference} vanished")))?;
            tx.rollback().await?;
            return Ok(if order.status.is_terminal() { CancelOutcome::AlreadyTerminal { order } } else { CancelOutcome::Rejected { order } });
        }
        sqlx::query(RESTOCK_ORDER).bind(order_id).execute(&mut *tx).await?;

        let order = load_order(&mut tx, order_id).await?.ok_or_else(|| corrupt(format!("order {reference} vanished")))?;
        tx.commit().await?;
        Ok(CancelOutcome::Cancelled { order })
    }

    async fn advance(&self, reference: &str, to: OrderStatus) -> StoreResult<AdvanceOutcome> {
        let from = match to {
            OrderStatus::Processing => Some(OrderStatus::Confirmed),
            OrderStatus::Completed => Some(OrderStatus::Processing),
            _ => None,
        };
        let mut conn = self.pool.acquire().await?;
        if let Some(from) = from {
            let advanced = sqlx::query_scalar::<_, Uuid>(
                r#"UPDATE customer_orders
                   SET status = $2,
                       completed_at = CASE WHEN $2 = 'completed' THEN now() ELSE completed_at END,
                       notes = array_append(notes, $3),
                       updated_at = now()
                   WHERE reference = $1 AND status = $4
                   RETURNING id"#,
            )
            .bind(reference)
            .bind(to.as_str())
            .bind(format!("Status changed to {to}"))
            .bind(from.as_str())
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(id) = advanced {
                let order = load_order(&mut conn, id).await?.ok_or_else(|| corrupt(format!("order {reference} vanished")))?;
                return Ok(AdvanceOutcome::Advanced { order });
            }
        }
        let Some(id) = order_id_for(&mut conn, reference).await? else { return Ok(AdvanceOutcome::NotFound) };
        Ok(match load_order(&mut conn, id).await? {
            Some(order) => AdvanceOutcome::Rejected { order },
            None => AdvanceOutcome::NotFound,
        })
    }

    async fn inventory_item(&self, id: i64) -> StoreResult<Option<InventoryItem>> {
        let row = sqlx::query_as::<_, (i64, String, i32, Decimal)>("SELECT id, name, quantity_on_hand, unit_price FROM medicines WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id, name, qty, price)| InventoryItem::new(id, name, qty.max(0) as u32, price)))
    }

    async fn log_gateway_event(&self, entry: &GatewayLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO payment_gateway_log (provider, operation, order_reference, handle, simulated, raw_response) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.provider.as_str())
        .bind(entry.operation)
        .bind(entry.order_reference.as_deref())
        .bind(entry.handle.as_deref())
        .bind(entry.simulated)
        .bind(&entry.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
