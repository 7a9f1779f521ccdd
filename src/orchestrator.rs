//! Order-payment orchestration.
//!
//! `place_order` reserves stock and starts a payment. `finalize_payment`
//! is the single path that settles it, whether the result came from a
//! provider callback, a status poll or a staff cash confirmation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};
use crate::domain::aggregates::{CustomerSnapshot, LineItem, Order, OrderStatus, PaymentProvider, PaymentStatus, PaymentTransaction, TransactionStatus};
use crate::domain::events::{EmailRequest, OrderEvent};
use crate::domain::value_objects::{Money, OrderReference, PhoneNumber};
use crate::gateway::{cash, Gateways, InitiateRequest, ProviderOutcome};
use crate::notify::EventPublisher;
use crate::store::{AdvanceOutcome, CancelOutcome, CancelScope, GatewayLogEntry, NewOrder, OrderStore, SettleOutcome, Settlement, SettlementOutcome, StoreError, MAX_ITEM_QUANTITY};
use crate::{Error, Result};

/// Allowed difference between the declared and computed totals.
const AMOUNT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);
const MPESA_MIN: Decimal = Decimal::from_parts(1, 0, 0, false, 0);
const MPESA_MAX: Decimal = Decimal::from_parts(70_000, 0, 0, false, 0);
/// Largest total the `NUMERIC(12, 2)` amount columns hold.
const MAX_ORDER_TOTAL: Decimal = Decimal::from_parts(0xD4A5_0FFF, 0xE8, 0, false, 2);
const MAX_REFERENCE_ATTEMPTS: u32 = 3;

// =============================================================================
// Requests and results
// =============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OrderRequest {
    #[validate]
    pub customer: CustomerRequest,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<ItemRequest>,
    pub total: Decimal,
    pub payment_method: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CustomerRequest {
    #[validate(custom = "not_blank")]
    pub name: String,
    pub phone: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    #[validate(custom = "not_blank")]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRequest {
    pub id: i64,
    pub quantity: i64,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub order_reference: String,
    pub checkout_handle: String,
    pub approval_url: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub simulated: bool,
}

/// A provider's verdict on one payment, decoded from a callback or poll.
#[derive(Debug, Clone)]
pub struct PaymentResult {
    pub handle: String,
    pub outcome: ProviderOutcome,
    pub receipt: Option<String>,
    pub reason: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finalized {
    pub handle: String,
    pub status: TransactionStatus,
    pub receipt: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    /// False when the call found the transaction already settled or still pending.
    pub applied: bool,
}

/// What a status query reports: a cancelled transaction reads as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState { Pending, Completed, Failed }

impl From<TransactionStatus> for PaymentState {
    fn from(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Pending => Self::Pending,
            TransactionStatus::Completed => Self::Completed,
            TransactionStatus::Failed | TransactionStatus::Cancelled => Self::Failed,
        }
    }
}

impl Finalized {
    pub fn state(&self) -> PaymentState { self.status.into() }

    fn from_payment(handle: &str, payment: &PaymentTransaction, applied: bool) -> Self {
        Self {
            handle: handle.to_string(),
            status: payment.status,
            receipt: payment.receipt.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            applied,
        }
    }
}

fn not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut e = ValidationError::new("blank");
        e.message = Some("must not be blank".into());
        return Err(e);
    }
    Ok(())
}

/// First validation failure as `field: message`, nested paths dotted.
fn describe(errors: &ValidationErrors) -> String {
    fn walk(prefix: &str, errors: &ValidationErrors) -> Option<String> {
        let mut fields: Vec<_> = errors.errors().iter().collect();
        fields.sort_by_key(|(name, _)| **name);
        fields.into_iter().find_map(|(name, kind)| {
            let path = if prefix.is_empty() { name.to_string() } else { format!("{prefix}.{name}") };
            match kind {
                ValidationErrorsKind::Field(list) => list.first().map(|e| match &e.message {
                    Some(m) => format!("{path}: {m}"),
                    None => format!("{path}: invalid ({})", e.code),
                }),
                ValidationErrorsKind::Struct(inner) => walk(&path, inner),
                ValidationErrorsKind::List(items) => items.iter().find_map(|(i, inner)| walk(&format!("{path}[{i}]"), inner)),
            }
        })
    }
    walk("", errors).unwrap_or_else(|| "Invalid request".to_string())
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    store: Arc<dyn OrderStore>,
    gateways: Gateways,
    events: EventPublisher,
    currency: String,
}

struct Draft {
    customer: CustomerSnapshot,
    items: Vec<LineItem>,
    provider: PaymentProvider,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn OrderStore>, gateways: Gateways, events: EventPublisher, currency: impl Into<String>) -> Self {
        Self { store, gateways, events, currency: currency.into() }
    }

    /// All business checks, before anything is written.
    fn validate(&self, mut request: OrderRequest) -> Result<Draft> {
        // a blank email is an absent one
        request.customer.email = request.customer.email.take().map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        request.validate().map_err(|e| Error::Validation(describe(&e)))?;

        let phone = PhoneNumber::parse(&request.customer.phone).map_err(|e| Error::Validation(e.to_string()))?;
        let provider = PaymentProvider::parse(&request.payment_method)
            .ok_or_else(|| Error::Validation(format!("Unsupported payment method '{}'", request.payment_method)))?;

        let mut items = Vec::with_capacity(request.items.len());
        for (i, item) in request.items.iter().enumerate() {
            let quantity = u32::try_from(item.quantity)
                .ok()
                .filter(|q| (1..=MAX_ITEM_QUANTITY).contains(q))
                .ok_or_else(|| Error::Validation(format!("items[{i}].quantity: must be a whole number from 1 to {MAX_ITEM_QUANTITY}")))?;
            if item.price <= Decimal::ZERO {
                return Err(Error::Validation(format!("items[{i}].price: must be positive")));
            }
            let line = LineItem::new(item.id, quantity, item.price)
                .ok_or_else(|| Error::Validation(format!("items[{i}]: line total is too large")))?;
            items.push(line);
        }

        let computed = items
            .iter()
            .try_fold(Decimal::ZERO, |acc, l| acc.checked_add(l.line_total))
            .filter(|t| *t <= MAX_ORDER_TOTAL)
            .ok_or_else(|| Error::Validation(format!("Order total exceeds {MAX_ORDER_TOTAL}")))?;
        let total = Money::new(computed, &self.currency);
        if !total.approx_eq(request.total, AMOUNT_TOLERANCE) {
            return Err(Error::AmountMismatch { declared: request.total, computed });
        }
        if provider == PaymentProvider::Mpesa {
            let whole = total.whole_units();
            if whole < MPESA_MIN || whole > MPESA_MAX {
                return Err(Error::AmountOutOfRange { amount: whole, min: MPESA_MIN, max: MPESA_MAX });
            }
        }

        let customer = CustomerSnapshot {
            name: request.customer.name.trim().to_string(),
            phone,
            email: request.customer.email,
            address: request.customer.address.trim().to_string(),
        };
        Ok(Draft { customer, items, provider })
    }

    /// Writes the order pair, retrying on a reference collision.
    async fn persist(&self, draft: &Draft) -> Result<NewOrder> {
        let mut attempt = 1;
        loop {
            let order = Order::create(OrderReference::generate(Utc::now()), draft.customer.clone(), draft.items.clone(), &self.currency, draft.provider)
                .map_err(|e| Error::Validation(e.to_string()))?;
            let payment = PaymentTransaction::pending(order.id, order.total.amount(), &self.currency, draft.provider);
            let new = NewOrder { order, payment };
            match self.store.place(&new).await {
                Ok(()) => return Ok(new),
                Err(StoreError::DuplicateReference(reference)) if attempt < MAX_REFERENCE_ATTEMPTS => {
                    warn!(%reference, attempt, "order reference collision, regenerating");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[instrument(skip_all, fields(payment_method = %request.payment_method))]
    pub async fn place_order(&self, request: OrderRequest) -> Result<PlacedOrder> {
        let draft = self.validate(request)?;
        let gateway = self
            .gateways
            .get(draft.provider)
            .ok_or_else(|| Error::Validation(format!("Payment method '{}' is not available", draft.provider)))?;

        let new = self.persist(&draft).await?;
        let reference = new.order.reference.to_string();
        info!(order = %reference, total = %new.order.total.amount(), "order reserved, starting payment");

        let initiate = InitiateRequest {
            order_reference: reference.clone(),
            phone: new.order.customer.phone.clone(),
            amount: new.order.total.clone(),
            description: format!("Payment for order {reference}"),
        };
        let initiated = match gateway.initiate(&initiate).await {
            Ok(initiated) => initiated,
            Err(e) if e.is_timeout() => {
                // The provider may still have accepted. A later status poll naming the
                // provider's handle adopts it; a cancel releases the stock.
                warn!(order = %reference, error = %e, "payment initiation timed out, order left pending");
                self.audit(draft.provider, "initiate", Some(&reference), None, false, json!({ "error": e.to_string() })).await;
                return Err(Error::Gateway { source: e, order_reference: Some(reference) });
            }
            Err(e) => {
                warn!(order = %reference, error = %e, "payment initiation rejected, releasing stock");
                self.audit(draft.provider, "initiate", Some(&reference), None, false, json!({ "error": e.to_string() })).await;
                match self.store.discard(new.order.id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(order = %reference, "order settled before compensation, left in place"),
                    Err(de) => error!(order = %reference, error = %de, "failed to compensate rejected payment"),
                }
                return Err(Error::Gateway { source: e, order_reference: None });
            }
        };

        self.store.attach_handle(new.payment.id, &initiated.handle, initiated.simulated, &initiated.raw).await?;
        self.audit(draft.provider, "initiate", Some(&reference), Some(&initiated.handle), initiated.simulated, initiated.raw.clone()).await;

        self.events.order_event(OrderEvent::Placed {
            reference: reference.clone(),
            total: new.order.total.amount(),
            currency: new.order.total.currency().to_string(),
            provider: draft.provider,
        });
        self.events.email(EmailRequest::for_order("order_received", &new.order));

        Ok(PlacedOrder {
            order_reference: reference,
            checkout_handle: initiated.handle,
            approval_url: initiated.approval_url,
            amount: initiated.charged.amount(),
            currency: initiated.charged.currency().to_string(),
            simulated: initiated.simulated,
        })
    }

    /// Settles a pending transaction. Repeated or losing calls return the
    /// settled state without writing.
    #[instrument(skip_all, fields(handle = %result.handle, outcome = ?result.outcome))]
    pub async fn finalize_payment(&self, result: PaymentResult) -> Result<Finalized> {
        let handle = result.handle.as_str();
        let settlement = match result.outcome {
            ProviderOutcome::Pending => {
                let payment = self.known_payment(handle).await?;
                return Ok(Finalized::from_payment(handle, &payment, false));
            }
            ProviderOutcome::Success => Settlement {
                note: match &result.receipt {
                    Some(receipt) => format!("Payment confirmed, receipt {receipt}"),
                    None => "Payment confirmed".to_string(),
                },
                outcome: SettlementOutcome::Success { receipt: result.receipt.clone() },
                raw: result.raw.clone(),
            },
            ProviderOutcome::Failure | ProviderOutcome::Cancelled => {
                let reason = result.reason.clone().unwrap_or_else(|| match result.outcome {
                    ProviderOutcome::Cancelled => "Payment cancelled by customer".to_string(),
                    _ => "Payment failed".to_string(),
                });
                Settlement { note: format!("Payment failed: {reason}"), outcome: SettlementOutcome::Failure { reason }, raw: result.raw.clone() }
            }
        };

        match self.store.settle(handle, &settlement).await? {
            SettleOutcome::Applied { order, payment } => {
                info!(order = %order.reference, status = %order.status, "payment settled");
                match payment.status {
                    TransactionStatus::Completed => {
                        self.events.order_event(OrderEvent::Confirmed { reference: order.reference.to_string(), receipt: payment.receipt.clone() });
                        self.events.email(EmailRequest::for_order("payment_confirmed", &order));
                    }
                    _ => {
                        let reason = payment.failure_reason.clone().unwrap_or_default();
                        self.events.order_event(OrderEvent::Cancelled { reference: order.reference.to_string(), reason });
                        self.events.email(EmailRequest::for_order("payment_failed", &order));
                    }
                }
                Ok(Finalized::from_payment(handle, &payment, true))
            }
            SettleOutcome::AlreadySettled { payment } => {
                let wanted = match settlement.outcome {
                    SettlementOutcome::Success { .. } => TransactionStatus::Completed,
                    SettlementOutcome::Failure { .. } => TransactionStatus::Failed,
                };
                if payment.status == wanted {
                    info!(status = %payment.status, "duplicate settlement ignored");
                } else {
                    warn!(event = "RaceLost", settled = %payment.status, attempted = %wanted, "transaction already settled");
                }
                Ok(Finalized::from_payment(handle, &payment, false))
            }
            SettleOutcome::Unknown => {
                warn!(event = "UnknownTransaction", "no transaction for handle");
                Err(Error::UnknownTransaction(handle.to_string()))
            }
        }
    }

    /// Asks the provider and settles on a terminal answer. An order whose
    /// initiation timed out has no handle yet; the first handle the provider
    /// recognises for it is adopted.
    #[instrument(skip(self))]
    pub async fn poll_status(&self, handle: &str, order_reference: &str) -> Result<Finalized> {
        let payment = match self.store.payment_by_handle(handle).await? {
            Some(payment) => payment,
            None => match self.awaiting_handle(order_reference).await? {
                Some(payment) => payment,
                None => {
                    warn!(event = "UnknownTransaction", %handle, "no transaction for handle");
                    return Err(Error::UnknownTransaction(handle.to_string()));
                }
            },
        };
        let order = self.store.order_by_reference(order_reference).await?.ok_or_else(|| Error::OrderNotFound(order_reference.to_string()))?;
        if order.id != payment.order_id {
            return Err(Error::Validation(format!("Checkout request {handle} does not belong to order {order_reference}")));
        }
        if payment.status.is_terminal() { return Ok(Finalized::from_payment(handle, &payment, false)); }

        let gateway = self
            .gateways
            .get(payment.provider)
            .ok_or_else(|| Error::Validation(format!("Payment method '{}' is not available", payment.provider)))?;
        let report = gateway
            .query_status(handle)
            .await
            .map_err(|e| Error::Gateway { source: e, order_reference: Some(order_reference.to_string()) })?;
        self.audit(payment.provider, "query", Some(order_reference), Some(handle), report.simulated, report.raw.clone()).await;

        if payment.external_reference.is_none() {
            if !self.store.adopt_handle(payment.id, handle, report.simulated).await? {
                warn!(event = "UnknownTransaction", %handle, "transaction took another handle first");
                return Err(Error::UnknownTransaction(handle.to_string()));
            }
            info!(%handle, "handle adopted for a payment left without one");
        }

        if !report.outcome.is_terminal() { return Ok(Finalized::from_payment(handle, &payment, false)); }
        self.finalize_payment(PaymentResult {
            handle: handle.to_string(),
            outcome: report.outcome,
            receipt: report.receipt,
            reason: report.reason,
            settled_at: None,
            raw: report.raw,
        })
        .await
    }

    /// The pending transaction of `order_reference` when it has no handle.
    async fn awaiting_handle(&self, order_reference: &str) -> Result<Option<PaymentTransaction>> {
        let Some(order) = self.store.order_by_reference(order_reference).await? else { return Ok(None) };
        let payment = self.store.payment_for_order(order.id).await?;
        Ok(payment.filter(|p| p.status == TransactionStatus::Pending && p.external_reference.is_none()))
    }

    /// Customer cancellation of an order still awaiting payment; restocks.
    /// Cancelling an already cancelled order returns it unchanged. A payment
    /// that settled first wins and the cancellation is refused.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, reference: &str, reason: &str) -> Result<Order> {
        match self.store.cancel(reference, reason, CancelScope::Unpaid).await? {
            CancelOutcome::Cancelled { order } => {
                info!(payment_status = %order.payment_status.as_str(), "order cancelled");
                self.announce_cancel(&order, reason);
                Ok(order)
            }
            CancelOutcome::AlreadyTerminal { order } if order.status == OrderStatus::Cancelled => Ok(order),
            CancelOutcome::AlreadyTerminal { order } | CancelOutcome::Rejected { order } => {
                if order.payment_status == PaymentStatus::Paid {
                    warn!(event = "RaceLost", status = %order.status, "payment settled before the cancellation");
                }
                Err(Error::InvalidTransition { reference: reference.to_string(), from: order.status, to: OrderStatus::Cancelled })
            }
            CancelOutcome::NotFound => Err(Error::OrderNotFound(reference.to_string())),
        }
    }

    /// Staff cancellation of a paid order. Restocks and flags the payment
    /// for refund; no money moves through the provider.
    #[instrument(skip(self))]
    pub async fn refund_order(&self, reference: &str, reason: &str) -> Result<Order> {
        match self.store.cancel(reference, reason, CancelScope::Paid).await? {
            CancelOutcome::Cancelled { order } => {
                info!("paid order cancelled, refund due");
                self.announce_cancel(&order, reason);
                Ok(order)
            }
            CancelOutcome::AlreadyTerminal { order } if order.payment_status == PaymentStatus::Refunded => Ok(order),
            CancelOutcome::AlreadyTerminal { order } | CancelOutcome::Rejected { order } => {
                Err(Error::InvalidTransition { reference: reference.to_string(), from: order.status, to: OrderStatus::Cancelled })
            }
            CancelOutcome::NotFound => Err(Error::OrderNotFound(reference.to_string())),
        }
    }

    fn announce_cancel(&self, order: &Order, reason: &str) {
        self.events.order_event(OrderEvent::Cancelled { reference: order.reference.to_string(), reason: reason.to_string() });
        self.events.email(EmailRequest::for_order("order_cancelled", order));
    }

    /// Staff workflow: confirmed -> processing -> completed.
    #[instrument(skip(self))]
    pub async fn advance_order(&self, reference: &str, to: OrderStatus) -> Result<Order> {
        if !matches!(to, OrderStatus::Processing | OrderStatus::Completed) {
            return Err(Error::Validation(format!("Status must be processing or completed, got {to}")));
        }
        match self.store.advance(reference, to).await? {
            AdvanceOutcome::Advanced { order } => {
                self.events.order_event(OrderEvent::StatusChanged { reference: reference.to_string(), status: to });
                Ok(order)
            }
            AdvanceOutcome::Rejected { order } => Err(Error::InvalidTransition { reference: reference.to_string(), from: order.status, to }),
            AdvanceOutcome::NotFound => Err(Error::OrderNotFound(reference.to_string())),
        }
    }

    /// Records cash received for a cash-on-delivery order.
    #[instrument(skip(self))]
    pub async fn confirm_cash(&self, order_reference: &str, receipt: Option<String>) -> Result<Finalized> {
        let order = self.store.order_by_reference(order_reference).await?.ok_or_else(|| Error::OrderNotFound(order_reference.to_string()))?;
        let payment = self
            .store
            .payment_for_order(order.id)
            .await?
            .ok_or_else(|| Error::Datastore(StoreError::Corrupt(format!("order {order_reference} has no payment"))))?;
        if payment.provider != PaymentProvider::Cash {
            return Err(Error::Validation(format!("Order {order_reference} is paid by {}, not cash", payment.provider)));
        }
        let handle = payment.external_reference.clone().unwrap_or_else(|| cash::cash_handle(order_reference));
        let receipt = receipt.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| format!("CASH{}", Utc::now().format("%Y%m%d%H%M%S")));
        self.finalize_payment(PaymentResult {
            handle,
            outcome: ProviderOutcome::Success,
            receipt: Some(receipt),
            reason: None,
            settled_at: Some(Utc::now()),
            raw: json!({ "method": "cash_on_delivery", "recorded_at": Utc::now() }),
        })
        .await
    }

    pub async fn order(&self, reference: &str) -> Result<(Order, Option<PaymentTransaction>)> {
        let order = self.store.order_by_reference(reference).await?.ok_or_else(|| Error::OrderNotFound(reference.to_string()))?;
        let payment = self.store.payment_for_order(order.id).await?;
        Ok((order, payment))
    }

    async fn known_payment(&self, handle: &str) -> Result<PaymentTransaction> {
        match self.store.payment_by_handle(handle).await? {
            Some(payment) => Ok(payment),
            None => {
                warn!(event = "UnknownTransaction", %handle, "no transaction for handle");
                Err(Error::UnknownTransaction(handle.to_string()))
            }
        }
    }

    /// Audit failures are logged, never surfaced.
    async fn audit(&self, provider: PaymentProvider, operation: &'static str, order_reference: Option<&str>, handle: Option<&str>, simulated: bool, raw: Value) {
        let entry = GatewayLogEntry {
            provider,
            operation,
            order_reference: order_reference.map(str::to_string),
            handle: handle.map(str::to_string),
            simulated,
            raw,
        };
        if let Err(e) = self.store.log_gateway_event(&entry).await {
            error!(error = %e, "failed to write gateway log");
        }
    }
}
