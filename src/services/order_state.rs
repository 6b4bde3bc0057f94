//! Order state machine and financial roll-up.
//!
//! ```text
//! DRAFT --submit--> PENDING --confirm--> CONFIRMED --pay--> PAID --refund--> REFUNDED
//!   |  \________________confirm________/    |
//!   +------------- cancel ------------------+--> CANCELLED
//! ```
//!
//! `transition` is the only place legal moves are encoded.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::sales_order::OrderStatus;
use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OrderEvent {
    Submit,
    Confirm,
    Pay,
    Cancel,
    Refund,
}

impl OrderEvent {
    pub const ALL: [OrderEvent; 5] = [
        OrderEvent::Submit,
        OrderEvent::Confirm,
        OrderEvent::Pay,
        OrderEvent::Cancel,
        OrderEvent::Refund,
    ];

    /// State an order ends up in when the event applies.
    pub fn target(self) -> OrderStatus {
        match self {
            OrderEvent::Submit => OrderStatus::Pending,
            OrderEvent::Confirm => OrderStatus::Confirmed,
            OrderEvent::Pay => OrderStatus::Paid,
            OrderEvent::Cancel => OrderStatus::Cancelled,
            OrderEvent::Refund => OrderStatus::Refunded,
        }
    }
}

impl OrderStatus {
    /// No further events apply, apart from refunding a paid order.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Stock is reserved for the order's lines.
    pub fn holds_reservations(self) -> bool {
        self == OrderStatus::Confirmed
    }

    /// Line items may be added, changed or removed.
    pub fn lines_editable(self) -> bool {
        matches!(self, OrderStatus::Draft | OrderStatus::Pending)
    }

    /// Order-level discount, notes and payment method may change.
    pub fn details_editable(self) -> bool {
        matches!(
            self,
            OrderStatus::Draft | OrderStatus::Pending | OrderStatus::Confirmed
        )
    }
}

/// Legal successor of `from` under `event`, if any.
pub fn next_status(from: OrderStatus, event: OrderEvent) -> Option<OrderStatus> {
    use OrderEvent::*;
    use OrderStatus::*;

    match (from, event) {
        (Draft, Submit) => Some(Pending),
        (Draft | Pending, Confirm) => Some(Confirmed),
        (Confirmed, Pay) => Some(Paid),
        (Draft | Pending | Confirmed, Cancel) => Some(Cancelled),
        (Paid, Refund) => Some(Refunded),
        _ => None,
    }
}

/// Applies `event` to an order in state `from`.
pub fn transition(
    order_id: Uuid,
    from: OrderStatus,
    event: OrderEvent,
) -> Result<OrderStatus, ServiceError> {
    next_status(from, event).ok_or_else(|| ServiceError::InvalidStateTransition {
        order_id,
        from: from.to_string(),
        event: event.to_string(),
    })
}

/// Money amounts on an order, all non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `quantity * unit_price - discount_amount`, rejecting discounts larger than the line.
pub fn line_total(
    quantity: i32,
    unit_price: Decimal,
    discount_amount: Decimal,
) -> Result<Decimal, ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(
            "Line quantity must be positive".to_string(),
        ));
    }
    if unit_price.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "Unit price cannot be negative".to_string(),
        ));
    }
    if discount_amount.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "Line discount cannot be negative".to_string(),
        ));
    }
    let gross = unit_price * Decimal::from(quantity);
    if discount_amount > gross {
        return Err(ServiceError::ValidationError(format!(
            "Line discount {} exceeds line amount {}",
            discount_amount, gross
        )));
    }
    Ok(gross - discount_amount)
}

/// subtotal = sum of line totals; tax = subtotal * rate (2 dp);
/// total = subtotal + tax - discount, never below zero.
pub fn compute_totals<I>(line_totals: I, discount: Decimal, tax_rate: Decimal) -> OrderTotals
where
    I: IntoIterator<Item = Decimal>,
{
    let subtotal: Decimal = line_totals.into_iter().sum();
    let tax_amount = round_money(subtotal * tax_rate);
    let total = (subtotal + tax_amount - discount).max(Decimal::ZERO);

    OrderTotals {
        subtotal,
        discount,
        tax_amount,
        total,
    }
}
