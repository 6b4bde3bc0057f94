use crate::{
    db::DbPool,
    entities::stock_item::{self, Entity as StockItemEntity},
    entities::stock_movement::{self, Entity as StockMovementEntity, MovementReason, MovementType},
    errors::ServiceError,
    events::{publish, Event, EventSender},
    metrics,
};
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Reference type recorded on movements caused by a sales order.
pub const SALES_ORDER_REF: &str = "SALES_ORDER";

/// Result of a reservation attempt. Running out of stock is an expected
/// outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReserveOutcome {
    Reserved { available_after: i32 },
    Insufficient { available: i32 },
}

impl ReserveOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReserveOutcome::Reserved { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    pub requested: i32,
    pub released: i32,
}

impl ReleaseOutcome {
    pub fn over_released(&self) -> bool {
        self.released < self.requested
    }
}

/// Who and what caused a movement.
#[derive(Debug, Clone, Default)]
pub struct MovementContext {
    pub ref_type: Option<String>,
    pub ref_id: Option<Uuid>,
    pub serial_unit_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
}

impl MovementContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_order(order_id: Uuid) -> Self {
        Self {
            ref_type: Some(SALES_ORDER_REF.to_string()),
            ref_id: Some(order_id),
            ..Self::default()
        }
    }

    pub fn created_by(mut self, actor: Option<Uuid>) -> Self {
        self.created_by = actor;
        self
    }

    pub fn with_serial_unit(mut self, serial_unit_id: Uuid) -> Self {
        self.serial_unit_id = Some(serial_unit_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockSummary {
    pub item_count: u64,
    pub total_on_hand: i64,
    pub total_reserved: i64,
    pub low_stock_count: u64,
}

/// Movement-log replay compared with the materialized counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReconciliation {
    pub sku_id: String,
    pub ledger_quantity: i64,
    pub recorded_quantity: i32,
    pub reserved_quantity: i32,
    pub movement_count: usize,
}

impl LedgerReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.ledger_quantity == i64::from(self.recorded_quantity)
    }
}

fn validate_quantity(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "Quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

fn validate_sku(sku_id: &str) -> Result<(), ServiceError> {
    if sku_id.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "SKU id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Creates the counter row for a SKU on its first movement.
async fn ensure_item<C: ConnectionTrait>(conn: &C, sku_id: &str) -> Result<(), ServiceError> {
    let now = Utc::now();
    let item = stock_item::ActiveModel {
        sku_id: Set(sku_id.to_string()),
        quantity_on_hand: Set(0),
        reserved_quantity: Set(0),
        min_stock: Set(0),
        max_stock: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    StockItemEntity::insert(item)
        .on_conflict(
            OnConflict::column(stock_item::Column::SkuId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

pub async fn find_item<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
) -> Result<Option<stock_item::Model>, ServiceError> {
    Ok(StockItemEntity::find_by_id(sku_id.to_string()).one(conn).await?)
}

async fn load_item<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
) -> Result<stock_item::Model, ServiceError> {
    find_item(conn, sku_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Stock item {} not found", sku_id)))
}

async fn append_movement<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    movement_type: MovementType,
    quantity: i32,
    reason: MovementReason,
    ctx: &MovementContext,
) -> Result<stock_movement::Model, ServiceError> {
    let movement = stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        sku_id: Set(sku_id.to_string()),
        movement_type: Set(movement_type),
        quantity: Set(quantity),
        reason: Set(reason),
        serial_unit_id: Set(ctx.serial_unit_id),
        ref_type: Set(ctx.ref_type.clone()),
        ref_id: Set(ctx.ref_id),
        notes: Set(ctx.notes.clone()),
        created_by: Set(ctx.created_by),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    metrics::record_movement(&movement_type.to_string(), &reason.to_string());
    Ok(movement)
}

/// Atomically moves `quantity` from available to reserved.
///
/// The check and the increment are one conditional `UPDATE`, so concurrent
/// callers on the same SKU serialize on the row and can never reserve more
/// than is on hand.
pub async fn reserve_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    quantity: i32,
) -> Result<ReserveOutcome, ServiceError> {
    validate_quantity(quantity)?;

    let result = StockItemEntity::update_many()
        .col_expr(
            stock_item::Column::ReservedQuantity,
            Expr::col(stock_item::Column::ReservedQuantity).add(quantity),
        )
        .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock_item::Column::SkuId.eq(sku_id))
        .filter(
            Expr::expr(
                Expr::col(stock_item::Column::QuantityOnHand)
                    .sub(Expr::col(stock_item::Column::ReservedQuantity)),
            )
            .gte(quantity),
        )
        .exec(conn)
        .await?;

    let available = find_item(conn, sku_id)
        .await?
        .map(|item| item.available_quantity())
        .unwrap_or(0);

    let reserved = result.rows_affected == 1;
    metrics::record_reservation(reserved);

    if reserved {
        Ok(ReserveOutcome::Reserved {
            available_after: available,
        })
    } else {
        Ok(ReserveOutcome::Insufficient { available })
    }
}

const RELEASE_ATTEMPTS: usize = 3;

fn clamped_release(sku_id: &str, requested: i32, released: i32) -> ReleaseOutcome {
    warn!(
        sku_id = %sku_id,
        requested,
        released,
        "Over-release clamped at zero"
    );
    metrics::record_over_release();
    ReleaseOutcome {
        requested,
        released,
    }
}

/// Returns up to `quantity` reserved units to available stock. Never fails on
/// business grounds: a non-positive quantity is a no-op and asking for more
/// than is reserved drains the reservation and logs a warning.
///
/// The common case is one conditional `UPDATE`. An over-release drains with a
/// compare-and-set on the observed reservation so `released` is exact even
/// when other callers touch the same SKU.
pub async fn release_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    quantity: i32,
) -> Result<ReleaseOutcome, ServiceError> {
    if quantity <= 0 {
        warn!(sku_id = %sku_id, quantity, "Ignoring release of a non-positive quantity");
        return Ok(ReleaseOutcome {
            requested: quantity,
            released: 0,
        });
    }

    let mut last_seen = 0;
    for _ in 0..RELEASE_ATTEMPTS {
        let full = StockItemEntity::update_many()
            .col_expr(
                stock_item::Column::ReservedQuantity,
                Expr::col(stock_item::Column::ReservedQuantity).sub(quantity),
            )
            .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock_item::Column::SkuId.eq(sku_id))
            .filter(stock_item::Column::ReservedQuantity.gte(quantity))
            .exec(conn)
            .await?;
        if full.rows_affected == 1 {
            return Ok(ReleaseOutcome {
                requested: quantity,
                released: quantity,
            });
        }

        let reserved = match find_item(conn, sku_id).await? {
            Some(item) => item.reserved_quantity,
            None => {
                warn!(sku_id = %sku_id, quantity, "Release requested for a SKU with no stock record");
                metrics::record_over_release();
                return Ok(ReleaseOutcome {
                    requested: quantity,
                    released: 0,
                });
            }
        };
        if reserved >= quantity {
            // topped up by a concurrent reserve; the full release fits now
            continue;
        }
        last_seen = reserved;

        let drained = StockItemEntity::update_many()
            .col_expr(stock_item::Column::ReservedQuantity, Expr::value(0))
            .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock_item::Column::SkuId.eq(sku_id))
            .filter(stock_item::Column::ReservedQuantity.eq(reserved))
            .exec(conn)
            .await?;
        if drained.rows_affected == 1 {
            return Ok(clamped_release(sku_id, quantity, reserved));
        }
    }

    // Still contended: clamp unconditionally and report the last observed hold.
    StockItemEntity::update_many()
        .col_expr(
            stock_item::Column::ReservedQuantity,
            Expr::case(
                Expr::col(stock_item::Column::ReservedQuantity).gte(quantity),
                Expr::col(stock_item::Column::ReservedQuantity).sub(quantity),
            )
            .finally(0)
            .into(),
        )
        .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock_item::Column::SkuId.eq(sku_id))
        .exec(conn)
        .await?;
    Ok(clamped_release(sku_id, quantity, last_seen.min(quantity)))
}

/// Converts a reservation into a permanent decrement and records the sale.
pub async fn commit_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    quantity: i32,
    ctx: &MovementContext,
) -> Result<stock_movement::Model, ServiceError> {
    validate_quantity(quantity)?;

    let result = StockItemEntity::update_many()
        .col_expr(
            stock_item::Column::ReservedQuantity,
            Expr::col(stock_item::Column::ReservedQuantity).sub(quantity),
        )
        .col_expr(
            stock_item::Column::QuantityOnHand,
            Expr::col(stock_item::Column::QuantityOnHand).sub(quantity),
        )
        .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock_item::Column::SkuId.eq(sku_id))
        .filter(stock_item::Column::ReservedQuantity.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let reserved = find_item(conn, sku_id)
            .await?
            .map(|item| item.reserved_quantity)
            .unwrap_or(0);
        error!(
            sku_id = %sku_id,
            requested = quantity,
            reserved,
            ref_id = ?ctx.ref_id,
            "Commit without a matching reservation"
        );
        return Err(ServiceError::ReservationMissing {
            sku_id: sku_id.to_string(),
            requested: quantity,
            reserved,
        });
    }

    append_movement(
        conn,
        sku_id,
        MovementType::Out,
        quantity,
        MovementReason::Sale,
        ctx,
    )
    .await
}

/// Adds stock on hand and records an inbound movement.
pub async fn receive_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    quantity: i32,
    reason: MovementReason,
    ctx: &MovementContext,
) -> Result<stock_item::Model, ServiceError> {
    validate_sku(sku_id)?;
    validate_quantity(quantity)?;
    if matches!(reason, MovementReason::Sale | MovementReason::Damaged) {
        return Err(ServiceError::ValidationError(format!(
            "{} is not an inbound movement reason",
            reason
        )));
    }

    ensure_item(conn, sku_id).await?;

    StockItemEntity::update_many()
        .col_expr(
            stock_item::Column::QuantityOnHand,
            Expr::col(stock_item::Column::QuantityOnHand).add(quantity),
        )
        .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock_item::Column::SkuId.eq(sku_id))
        .exec(conn)
        .await?;

    append_movement(conn, sku_id, MovementType::In, quantity, reason, ctx).await?;
    load_item(conn, sku_id).await
}

/// Removes unreserved stock outside of a sale (transfer out, damage, shrinkage).
pub async fn issue_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    quantity: i32,
    reason: MovementReason,
    ctx: &MovementContext,
) -> Result<stock_item::Model, ServiceError> {
    validate_quantity(quantity)?;
    if !matches!(
        reason,
        MovementReason::Transfer | MovementReason::Adjustment | MovementReason::Damaged
    ) {
        return Err(ServiceError::ValidationError(format!(
            "{} is not a manual outbound movement reason",
            reason
        )));
    }

    let result = StockItemEntity::update_many()
        .col_expr(
            stock_item::Column::QuantityOnHand,
            Expr::col(stock_item::Column::QuantityOnHand).sub(quantity),
        )
        .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock_item::Column::SkuId.eq(sku_id))
        .filter(
            Expr::expr(
                Expr::col(stock_item::Column::QuantityOnHand)
                    .sub(Expr::col(stock_item::Column::ReservedQuantity)),
            )
            .gte(quantity),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let available = find_item(conn, sku_id)
            .await?
            .map(|item| item.available_quantity())
            .unwrap_or(0);
        return Err(ServiceError::InsufficientStock {
            sku_id: sku_id.to_string(),
            requested: quantity,
            available,
        });
    }

    append_movement(conn, sku_id, MovementType::Out, quantity, reason, ctx).await?;
    load_item(conn, sku_id).await
}

const ADJUST_ATTEMPTS: usize = 3;

/// Sets on-hand stock to `new_quantity_on_hand`, writing one ADJUSTMENT movement
/// for the signed difference. Returns `None` when nothing changed.
pub async fn adjust_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    new_quantity_on_hand: i32,
    ctx: &MovementContext,
) -> Result<Option<(stock_item::Model, stock_movement::Model)>, ServiceError> {
    validate_sku(sku_id)?;
    if new_quantity_on_hand < 0 {
        return Err(ServiceError::ValidationError(
            "Quantity on hand cannot be negative".to_string(),
        ));
    }

    ensure_item(conn, sku_id).await?;

    for _ in 0..ADJUST_ATTEMPTS {
        let current = load_item(conn, sku_id).await?;
        if new_quantity_on_hand < current.reserved_quantity {
            return Err(ServiceError::ValidationError(format!(
                "Cannot set {} on hand below its {} reserved units",
                sku_id, current.reserved_quantity
            )));
        }
        let delta = new_quantity_on_hand - current.quantity_on_hand;
        if delta == 0 {
            return Ok(None);
        }

        // Compare-and-set on the value we based the delta on
        let result = StockItemEntity::update_many()
            .col_expr(
                stock_item::Column::QuantityOnHand,
                Expr::value(new_quantity_on_hand),
            )
            .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock_item::Column::SkuId.eq(sku_id))
            .filter(stock_item::Column::QuantityOnHand.eq(current.quantity_on_hand))
            .filter(stock_item::Column::ReservedQuantity.lte(new_quantity_on_hand))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            continue;
        }

        let movement_type = if delta > 0 {
            MovementType::In
        } else {
            MovementType::Out
        };
        let movement = append_movement(
            conn,
            sku_id,
            movement_type,
            delta.abs(),
            MovementReason::Adjustment,
            ctx,
        )
        .await?;
        let item = load_item(conn, sku_id).await?;
        return Ok(Some((item, movement)));
    }

    Err(ServiceError::InvalidOperation(format!(
        "Stock for {} kept changing during adjustment; retry",
        sku_id
    )))
}

/// Stock Ledger: per-SKU counters plus the append-only movement log.
#[derive(Clone)]
pub struct StockLedgerService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl StockLedgerService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn begin(&self) -> Result<DatabaseTransaction, ServiceError> {
        self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start stock ledger transaction");
            ServiceError::DatabaseError(e)
        })
    }

    #[instrument(skip(self))]
    pub async fn reserve(&self, sku_id: &str, quantity: i32) -> Result<ReserveOutcome, ServiceError> {
        let txn = self.begin().await?;
        let outcome = reserve_in(&txn, sku_id, quantity).await?;
        txn.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn release(&self, sku_id: &str, quantity: i32) -> Result<ReleaseOutcome, ServiceError> {
        let txn = self.begin().await?;
        let outcome = release_in(&txn, sku_id, quantity).await?;
        txn.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self, ctx))]
    pub async fn commit(
        &self,
        sku_id: &str,
        quantity: i32,
        ctx: MovementContext,
    ) -> Result<stock_movement::Model, ServiceError> {
        let txn = self.begin().await?;
        let movement = commit_in(&txn, sku_id, quantity, &ctx).await?;
        txn.commit().await?;
        self.notify_if_low(sku_id).await?;
        Ok(movement)
    }

    #[instrument(skip(self, ctx))]
    pub async fn receive(
        &self,
        sku_id: &str,
        quantity: i32,
        reason: MovementReason,
        ctx: MovementContext,
    ) -> Result<stock_item::Model, ServiceError> {
        let txn = self.begin().await?;
        let item = receive_in(&txn, sku_id, quantity, reason, &ctx).await?;
        txn.commit().await?;

        info!(sku_id = %sku_id, quantity, reason = %reason, on_hand = item.quantity_on_hand, "Stock received");
        publish(
            &self.event_sender,
            Event::StockReceived {
                sku_id: sku_id.to_string(),
                quantity,
                reason,
            },
        )
        .await;
        Ok(item)
    }

    #[instrument(skip(self, ctx))]
    pub async fn issue(
        &self,
        sku_id: &str,
        quantity: i32,
        reason: MovementReason,
        ctx: MovementContext,
    ) -> Result<stock_item::Model, ServiceError> {
        let txn = self.begin().await?;
        let item = issue_in(&txn, sku_id, quantity, reason, &ctx).await?;
        txn.commit().await?;

        info!(sku_id = %sku_id, quantity, reason = %reason, on_hand = item.quantity_on_hand, "Stock issued");
        publish(
            &self.event_sender,
            Event::StockIssued {
                sku_id: sku_id.to_string(),
                quantity,
                reason,
            },
        )
        .await;
        self.publish_low(&item).await;
        Ok(item)
    }

    #[instrument(skip(self, ctx))]
    pub async fn adjust(
        &self,
        sku_id: &str,
        new_quantity_on_hand: i32,
        ctx: MovementContext,
    ) -> Result<Option<stock_movement::Model>, ServiceError> {
        let txn = self.begin().await?;
        let adjusted = adjust_in(&txn, sku_id, new_quantity_on_hand, &ctx).await?;
        txn.commit().await?;

        let Some((item, movement)) = adjusted else {
            info!(sku_id = %sku_id, "Adjustment matched current stock; nothing recorded");
            return Ok(None);
        };

        let old_quantity = match movement.movement_type {
            MovementType::In => item.quantity_on_hand - movement.quantity,
            MovementType::Out => item.quantity_on_hand + movement.quantity,
        };
        info!(sku_id = %sku_id, old_quantity, new_quantity = item.quantity_on_hand, "Stock adjusted");
        publish(
            &self.event_sender,
            Event::StockAdjusted {
                sku_id: sku_id.to_string(),
                old_quantity,
                new_quantity: item.quantity_on_hand,
            },
        )
        .await;
        self.publish_low(&item).await;
        Ok(Some(movement))
    }

    /// Sets the replenishment thresholds for a SKU, creating its record if needed.
    #[instrument(skip(self))]
    pub async fn update_levels(
        &self,
        sku_id: &str,
        min_stock: i32,
        max_stock: Option<i32>,
    ) -> Result<stock_item::Model, ServiceError> {
        validate_sku(sku_id)?;
        if min_stock < 0 {
            return Err(ServiceError::ValidationError(
                "Minimum stock cannot be negative".to_string(),
            ));
        }
        if let Some(max) = max_stock {
            if max < min_stock {
                return Err(ServiceError::ValidationError(format!(
                    "Maximum stock {} is below minimum stock {}",
                    max, min_stock
                )));
            }
        }

        let txn = self.begin().await?;
        ensure_item(&txn, sku_id).await?;
        StockItemEntity::update_many()
            .col_expr(stock_item::Column::MinStock, Expr::value(min_stock))
            .col_expr(stock_item::Column::MaxStock, Expr::value(max_stock))
            .col_expr(stock_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock_item::Column::SkuId.eq(sku_id))
            .exec(&txn)
            .await?;
        let item = load_item(&txn, sku_id).await?;
        txn.commit().await?;
        Ok(item)
    }

    pub async fn get_stock(&self, sku_id: &str) -> Result<Option<stock_item::Model>, ServiceError> {
        find_item(&*self.db_pool, sku_id).await
    }

    pub async fn list_low_stock(&self) -> Result<Vec<stock_item::Model>, ServiceError> {
        Ok(StockItemEntity::find()
            .filter(
                Expr::col(stock_item::Column::QuantityOnHand)
                    .lte(Expr::col(stock_item::Column::MinStock)),
            )
            .order_by_asc(stock_item::Column::SkuId)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn list_out_of_stock(&self) -> Result<Vec<stock_item::Model>, ServiceError> {
        Ok(StockItemEntity::find()
            .filter(stock_item::Column::QuantityOnHand.eq(0))
            .order_by_asc(stock_item::Column::SkuId)
            .all(&*self.db_pool)
            .await?)
    }

    /// Movements for a SKU, newest first.
    pub async fn movements_for_sku(
        &self,
        sku_id: &str,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        Ok(StockMovementEntity::find()
            .filter(stock_movement::Column::SkuId.eq(sku_id))
            .order_by_desc(stock_movement::Column::CreatedAt)
            .order_by_desc(stock_movement::Column::Id)
            .all(&*self.db_pool)
            .await?)
    }

    /// Movements caused by one referenced document, e.g. a sales order.
    pub async fn movements_for_reference(
        &self,
        ref_type: &str,
        ref_id: Uuid,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        Ok(StockMovementEntity::find()
            .filter(stock_movement::Column::RefType.eq(ref_type))
            .filter(stock_movement::Column::RefId.eq(ref_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn summary(&self) -> Result<StockSummary, ServiceError> {
        let items = StockItemEntity::find().all(&*self.db_pool).await?;
        Ok(StockSummary {
            item_count: items.len() as u64,
            total_on_hand: items.iter().map(|i| i64::from(i.quantity_on_hand)).sum(),
            total_reserved: items.iter().map(|i| i64::from(i.reserved_quantity)).sum(),
            low_stock_count: items.iter().filter(|i| i.is_low()).count() as u64,
        })
    }

    /// Replays the movement log for a SKU and compares it with the counter.
    /// Mismatches are reported, never repaired.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, sku_id: &str) -> Result<LedgerReconciliation, ServiceError> {
        let item = load_item(&*self.db_pool, sku_id).await?;
        let movements = StockMovementEntity::find()
            .filter(stock_movement::Column::SkuId.eq(sku_id))
            .all(&*self.db_pool)
            .await?;

        let report = LedgerReconciliation {
            sku_id: sku_id.to_string(),
            ledger_quantity: movements.iter().map(|m| m.signed_quantity()).sum(),
            recorded_quantity: item.quantity_on_hand,
            reserved_quantity: item.reserved_quantity,
            movement_count: movements.len(),
        };

        if !report.is_consistent() {
            error!(
                sku_id = %sku_id,
                ledger_quantity = report.ledger_quantity,
                recorded_quantity = report.recorded_quantity,
                "Stock counter does not match the movement ledger"
            );
            publish(
                &self.event_sender,
                Event::StockReconciliationMismatch {
                    sku_id: sku_id.to_string(),
                    ledger_quantity: report.ledger_quantity,
                    recorded_quantity: report.recorded_quantity,
                },
            )
            .await;
        }
        Ok(report)
    }

    /// Publishes a low-stock event if the SKU sits at or below its minimum.
    pub async fn notify_if_low(&self, sku_id: &str) -> Result<(), ServiceError> {
        if let Some(item) = find_item(&*self.db_pool, sku_id).await? {
            self.publish_low(&item).await;
        }
        Ok(())
    }

    async fn publish_low(&self, item: &stock_item::Model) {
        if item.is_low() {
            publish(
                &self.event_sender,
                Event::StockLow {
                    sku_id: item.sku_id.clone(),
                    quantity_on_hand: item.quantity_on_hand,
                    min_stock: item.min_stock,
                },
            )
            .await;
        }
    }
}
