use crate::{
    db::DbPool,
    entities::payment::{self, Entity as PaymentEntity, PaymentStatus},
    entities::sales_order::{self, OrderStatus},
    entities::sales_order_line,
    entities::serial_unit::SerialUnitStatus,
    entities::stock_movement::MovementReason,
    errors::ServiceError,
    events::{publish, Event, EventSender},
    metrics,
    services::installments,
    services::order_state::{self, OrderEvent},
    services::orders::{claim_order_in, lines_for_order_in, load_order_in, versioned_update_in},
    services::serial_units,
    services::stock_ledger::{self, MovementContext, ReserveOutcome, StockLedgerService},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Identifies the order to move and who is moving it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub order_id: Uuid,
    /// Recorded on stock movements; defaults to the order's creator.
    pub actor_id: Option<Uuid>,
    /// When set, the order must still be at this version.
    pub expected_version: Option<i32>,
}

impl TransitionRequest {
    pub fn new(order_id: Uuid) -> Self {
        Self {
            order_id,
            actor_id: None,
            expected_version: None,
        }
    }

    pub fn acting_as(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn at_version(mut self, version: i32) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineAvailability {
    pub line_id: Uuid,
    pub sku_id: String,
    pub requested: i32,
    pub available: i32,
}

impl LineAvailability {
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.requested
    }
}

/// Read-only preview of whether an order could be confirmed right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub lines: Vec<LineAvailability>,
}

impl AvailabilityReport {
    pub fn all_available(&self) -> bool {
        self.lines.iter().all(LineAvailability::is_sufficient)
    }

    pub fn first_shortfall(&self) -> Option<&LineAvailability> {
        self.lines.iter().find(|l| !l.is_sufficient())
    }
}

/// Drives order transitions that move stock. Each call runs in one database
/// transaction that claims the order row before touching any SKU.
#[derive(Clone)]
pub struct ReservationCoordinator {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    stock: StockLedgerService,
    refund_restocks_inventory: bool,
}

impl ReservationCoordinator {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        refund_restocks_inventory: bool,
    ) -> Self {
        let stock = StockLedgerService::new(db_pool.clone(), event_sender.clone());
        Self {
            db_pool,
            event_sender,
            stock,
            refund_restocks_inventory,
        }
    }

    async fn begin(&self) -> Result<DatabaseTransaction, ServiceError> {
        self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start coordinator transaction");
            ServiceError::DatabaseError(e)
        })
    }

    /// Loads the order and decides whether `event` applies. `Ok(None)` means
    /// the order already sits in the event's target state.
    async fn prepare(
        &self,
        txn: &DatabaseTransaction,
        request: &TransitionRequest,
        event: OrderEvent,
    ) -> Result<Option<(sales_order::Model, OrderStatus)>, ServiceError> {
        claim_order_in(txn, request.order_id).await?;
        let order = load_order_in(txn, request.order_id).await?;

        if order.status == event.target() {
            info!(
                order_id = %order.id,
                status = %order.status,
                event = %event,
                "Order already in target state; nothing to do"
            );
            return Ok(None);
        }
        if let Some(expected) = request.expected_version {
            if expected != order.version {
                warn!(
                    order_id = %order.id,
                    expected,
                    current = order.version,
                    "Stale order version"
                );
                return Err(ServiceError::ConcurrentModification(order.id));
            }
        }

        let next = order_state::transition(order.id, order.status, event)?;
        Ok(Some((order, next)))
    }

    async fn finish(
        &self,
        event: OrderEvent,
        previous: OrderStatus,
        updated: &sales_order::Model,
    ) {
        metrics::record_transition(&event.to_string(), true);
        info!(
            order_id = %updated.id,
            order_number = %updated.order_number,
            from = %previous,
            to = %updated.status,
            "Order transition applied"
        );
        publish(
            &self.event_sender,
            Event::OrderStatusChanged {
                order_id: updated.id,
                old_status: previous,
                new_status: updated.status,
            },
        )
        .await;
    }

    /// DRAFT/PENDING -> CONFIRMED, reserving stock for every line or none.
    #[instrument(skip(self), fields(order_id = %request.order_id))]
    pub async fn confirm(&self, request: TransitionRequest) -> Result<sales_order::Model, ServiceError> {
        let event = OrderEvent::Confirm;
        let txn = self.begin().await?;
        let (order, next) = match self.prepare(&txn, &request, event).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return load_order_in(&txn, request.order_id).await,
            Err(e) => {
                metrics::record_transition(&event.to_string(), false);
                return Err(e);
            }
        };

        let lines = lines_for_order_in(&txn, order.id).await?;
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} has no line items",
                order.order_number
            )));
        }

        let changes = sales_order::ActiveModel {
            status: Set(next),
            confirmed_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        let updated = versioned_update_in(&txn, order.id, order.version, changes).await?;

        let mut reserved: Vec<&sales_order_line::Model> = Vec::with_capacity(lines.len());
        for line in &lines {
            match reserve_line(&txn, line).await {
                Ok(()) => reserved.push(line),
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        sku_id = %line.sku_id,
                        reserved_lines = reserved.len(),
                        error = %e,
                        "Confirmation failed; releasing earlier lines"
                    );
                    if let Err(release_err) = release_lines(&txn, &reserved).await {
                        error!(order_id = %order.id, error = %release_err, "Compensating release failed");
                    }
                    txn.rollback().await?;
                    metrics::record_transition(&event.to_string(), false);
                    return Err(e);
                }
            }
        }

        txn.commit().await?;
        self.finish(event, order.status, &updated).await;
        Ok(updated)
    }

    /// CONFIRMED -> PAID: reservations become permanent decrements and a payment is recorded.
    #[instrument(skip(self), fields(order_id = %request.order_id))]
    pub async fn pay(&self, request: TransitionRequest) -> Result<sales_order::Model, ServiceError> {
        let event = OrderEvent::Pay;
        let txn = self.begin().await?;
        let (order, next) = match self.prepare(&txn, &request, event).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return load_order_in(&txn, request.order_id).await,
            Err(e) => {
                metrics::record_transition(&event.to_string(), false);
                return Err(e);
            }
        };

        let now = Utc::now();
        let lines = lines_for_order_in(&txn, order.id).await?;
        let changes = sales_order::ActiveModel {
            status: Set(next),
            paid_at: Set(Some(now)),
            ..Default::default()
        };
        let updated = versioned_update_in(&txn, order.id, order.version, changes).await?;

        let ctx = MovementContext::for_order(order.id)
            .created_by(Some(request.actor_id.unwrap_or(order.created_by)));
        for line in &lines {
            if let Err(e) = commit_line(&txn, line, &ctx).await {
                error!(order_id = %order.id, sku_id = %line.sku_id, error = %e, "Payment could not commit stock");
                txn.rollback().await?;
                metrics::record_transition(&event.to_string(), false);
                return Err(e);
            }
        }

        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            amount: Set(updated.total),
            method: Set(updated.payment_method),
            status: Set(PaymentStatus::Completed),
            paid_at: Set(now),
            refunded_at: Set(None),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        self.finish(event, order.status, &updated).await;
        publish(
            &self.event_sender,
            Event::OrderPaid {
                order_id: order.id,
                payment_id: payment.id,
                amount: payment.amount,
            },
        )
        .await;

        let skus: BTreeSet<&str> = lines.iter().map(|l| l.sku_id.as_str()).collect();
        for sku_id in skus {
            if let Err(e) = self.stock.notify_if_low(sku_id).await {
                warn!(sku_id = %sku_id, error = %e, "Low stock check failed");
            }
        }
        Ok(updated)
    }

    /// DRAFT/PENDING/CONFIRMED -> CANCELLED, releasing whatever the order holds.
    #[instrument(skip(self), fields(order_id = %request.order_id))]
    pub async fn cancel(&self, request: TransitionRequest) -> Result<sales_order::Model, ServiceError> {
        let event = OrderEvent::Cancel;
        let txn = self.begin().await?;
        let (order, next) = match self.prepare(&txn, &request, event).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return load_order_in(&txn, request.order_id).await,
            Err(e) => {
                metrics::record_transition(&event.to_string(), false);
                return Err(e);
            }
        };

        let changes = sales_order::ActiveModel {
            status: Set(next),
            cancelled_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        let updated = versioned_update_in(&txn, order.id, order.version, changes).await?;

        if order.status.holds_reservations() {
            let lines = lines_for_order_in(&txn, order.id).await?;
            let held: Vec<&sales_order_line::Model> = lines.iter().collect();
            release_lines(&txn, &held).await?;
        }
        let cancelled_plan = installments::cancel_for_order_in(&txn, order.id).await?;

        txn.commit().await?;
        self.finish(event, order.status, &updated).await;
        if let Some(plan_id) = cancelled_plan {
            publish(&self.event_sender, Event::InstallmentPlanCancelled(plan_id)).await;
        }
        Ok(updated)
    }

    /// PAID -> REFUNDED. Plain stock goes back on hand when configured to;
    /// serialized units become RETURNED and wait for an explicit restock.
    #[instrument(skip(self), fields(order_id = %request.order_id))]
    pub async fn refund(&self, request: TransitionRequest) -> Result<sales_order::Model, ServiceError> {
        let event = OrderEvent::Refund;
        let txn = self.begin().await?;
        let (order, next) = match self.prepare(&txn, &request, event).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return load_order_in(&txn, request.order_id).await,
            Err(e) => {
                metrics::record_transition(&event.to_string(), false);
                return Err(e);
            }
        };

        let now = Utc::now();
        let changes = sales_order::ActiveModel {
            status: Set(next),
            refunded_at: Set(Some(now)),
            ..Default::default()
        };
        let updated = versioned_update_in(&txn, order.id, order.version, changes).await?;

        let ctx = MovementContext::for_order(order.id)
            .created_by(Some(request.actor_id.unwrap_or(order.created_by)))
            .with_notes("Order refunded");
        for line in lines_for_order_in(&txn, order.id).await? {
            if line.serialized {
                for unit in serial_units::units_for_line_in(&txn, line.id).await? {
                    if unit.status == SerialUnitStatus::Sold {
                        serial_units::mark_returned_in(&txn, unit.id).await?;
                    }
                }
            } else if self.refund_restocks_inventory {
                stock_ledger::receive_in(
                    &txn,
                    &line.sku_id,
                    line.quantity,
                    MovementReason::Return,
                    &ctx,
                )
                .await?;
            }
        }

        PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Refunded))
            .col_expr(payment::Column::RefundedAt, Expr::value(Some(now)))
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .exec(&txn)
            .await?;
        let cancelled_plan = installments::cancel_for_order_in(&txn, order.id).await?;

        txn.commit().await?;
        self.finish(event, order.status, &updated).await;
        publish(
            &self.event_sender,
            Event::OrderRefunded {
                order_id: order.id,
                restocked: self.refund_restocks_inventory,
            },
        )
        .await;
        if let Some(plan_id) = cancelled_plan {
            publish(&self.event_sender, Event::InstallmentPlanCancelled(plan_id)).await;
        }
        Ok(updated)
    }

    pub async fn confirm_order(&self, order_id: Uuid) -> Result<sales_order::Model, ServiceError> {
        self.confirm(TransitionRequest::new(order_id)).await
    }

    pub async fn pay_order(&self, order_id: Uuid) -> Result<sales_order::Model, ServiceError> {
        self.pay(TransitionRequest::new(order_id)).await
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<sales_order::Model, ServiceError> {
        self.cancel(TransitionRequest::new(order_id)).await
    }

    pub async fn refund_order(&self, order_id: Uuid) -> Result<sales_order::Model, ServiceError> {
        self.refund(TransitionRequest::new(order_id)).await
    }

    /// Per-line availability without reserving anything.
    #[instrument(skip(self))]
    pub async fn check_availability(&self, order_id: Uuid) -> Result<AvailabilityReport, ServiceError> {
        let db = &*self.db_pool;
        let order = load_order_in(db, order_id).await?;
        let mut lines = Vec::new();
        for line in lines_for_order_in(db, order_id).await? {
            let available = stock_ledger::find_item(db, &line.sku_id)
                .await?
                .map(|item| item.available_quantity())
                .unwrap_or(0);
            lines.push(LineAvailability {
                line_id: line.id,
                sku_id: line.sku_id,
                requested: line.quantity,
                available,
            });
        }
        Ok(AvailabilityReport {
            order_id,
            status: order.status,
            lines,
        })
    }

    /// Payments recorded against an order, oldest first.
    pub async fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<payment::Model>, ServiceError> {
        Ok(PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::PaidAt)
            .all(&*self.db_pool)
            .await?)
    }
}

/// Ledger reservation for one line plus its serial units.
async fn reserve_line(
    txn: &DatabaseTransaction,
    line: &sales_order_line::Model,
) -> Result<(), ServiceError> {
    match stock_ledger::reserve_in(txn, &line.sku_id, line.quantity).await? {
        ReserveOutcome::Reserved { .. } => {}
        ReserveOutcome::Insufficient { available } => {
            return Err(ServiceError::InsufficientStock {
                sku_id: line.sku_id.clone(),
                requested: line.quantity,
                available,
            });
        }
    }
    if !line.serialized {
        return Ok(());
    }

    let assigned = match line.serial_unit_id {
        Some(unit_id) => {
            serial_units::reserve_specific_in(txn, unit_id, &line.sku_id, line.id).await
        }
        None => serial_units::assign_for_reservation_in(txn, &line.sku_id, line.quantity, line.id)
            .await
            .map(|_| ()),
    };
    if assigned.is_err() {
        stock_ledger::release_in(txn, &line.sku_id, line.quantity).await?;
    }
    assigned
}

/// Gives back what `reserve_line` took for each line.
async fn release_lines(
    txn: &DatabaseTransaction,
    lines: &[&sales_order_line::Model],
) -> Result<(), ServiceError> {
    for line in lines {
        if line.serialized {
            for unit in serial_units::units_for_line_in(txn, line.id).await? {
                if unit.status == SerialUnitStatus::Reserved {
                    serial_units::release_unit_in(txn, unit.id).await?;
                }
            }
        }
        stock_ledger::release_in(txn, &line.sku_id, line.quantity).await?;
    }
    Ok(())
}

/// Converts one line's reservation into a sale. Serialized lines commit unit by unit
/// so every SALE movement names the unit sold.
async fn commit_line(
    txn: &DatabaseTransaction,
    line: &sales_order_line::Model,
    ctx: &MovementContext,
) -> Result<(), ServiceError> {
    if !line.serialized {
        stock_ledger::commit_in(txn, &line.sku_id, line.quantity, ctx).await?;
        return Ok(());
    }

    let units: Vec<_> = serial_units::units_for_line_in(txn, line.id)
        .await?
        .into_iter()
        .filter(|u| u.status == SerialUnitStatus::Reserved)
        .collect();
    if units.len() != line.quantity as usize {
        error!(
            line_id = %line.id,
            sku_id = %line.sku_id,
            expected = line.quantity,
            reserved_units = units.len(),
            "Reserved serial units do not match the line quantity"
        );
        return Err(ServiceError::IntegrityViolation(format!(
            "Line {} holds {} reserved units of {}, expected {}",
            line.id,
            units.len(),
            line.sku_id,
            line.quantity
        )));
    }
    for unit in units {
        serial_units::mark_sold_in(txn, unit.id).await?;
        stock_ledger::commit_in(txn, &line.sku_id, 1, &ctx.clone().with_serial_unit(unit.id))
            .await?;
    }
    Ok(())
}

/// Sum of completed payments for an order.
pub fn paid_amount(payments: &[payment::Model]) -> Decimal {
    payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Completed)
        .map(|p| p.amount)
        .sum()
}
