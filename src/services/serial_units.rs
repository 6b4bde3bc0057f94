use crate::{
    db::DbPool,
    entities::serial_unit::{self, Entity as SerialUnitEntity, SerialUnitStatus},
    entities::stock_movement::MovementReason,
    errors::{is_unique_violation, ServiceError},
    events::{publish, Event, EventSender},
    services::stock_ledger::{self, MovementContext, ReserveOutcome, SALES_ORDER_REF},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const ASSIGN_PASSES: usize = 5;

/// Unit counts for a serialized SKU next to the ledger's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialReconciliation {
    pub sku_id: String,
    pub in_stock_units: u64,
    pub reserved_units: u64,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
}

impl SerialReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.in_stock_units == self.available_quantity.max(0) as u64
            && self.reserved_units == self.reserved_quantity.max(0) as u64
    }
}

async fn flip_status<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    from: SerialUnitStatus,
    to: SerialUnitStatus,
    order_line_id: Option<Option<Uuid>>,
) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let mut update = SerialUnitEntity::update_many()
        .col_expr(serial_unit::Column::Status, Expr::value(to))
        .col_expr(serial_unit::Column::UpdatedAt, Expr::value(now));
    if let Some(line) = order_line_id {
        update = update.col_expr(serial_unit::Column::OrderLineId, Expr::value(line));
    }
    if to == SerialUnitStatus::Sold {
        update = update.col_expr(serial_unit::Column::SoldAt, Expr::value(Some(now)));
    }

    let result = update
        .filter(serial_unit::Column::Id.eq(unit_id))
        .filter(serial_unit::Column::Status.eq(from))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

async fn load_unit<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
) -> Result<serial_unit::Model, ServiceError> {
    SerialUnitEntity::find_by_id(unit_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Serial unit {} not found", unit_id)))
}

/// Picks `quantity` IN_STOCK units of a SKU, oldest received first, and flips
/// them to RESERVED for `order_line_id`. Must run in the same transaction as the
/// ledger reservation it mirrors.
pub async fn assign_for_reservation_in<C: ConnectionTrait>(
    conn: &C,
    sku_id: &str,
    quantity: i32,
    order_line_id: Uuid,
) -> Result<Vec<Uuid>, ServiceError> {
    let wanted = quantity.max(0) as usize;
    let mut assigned = Vec::with_capacity(wanted);

    for _ in 0..ASSIGN_PASSES {
        if assigned.len() == wanted {
            break;
        }
        let candidates = SerialUnitEntity::find()
            .filter(serial_unit::Column::SkuId.eq(sku_id))
            .filter(serial_unit::Column::Status.eq(SerialUnitStatus::InStock))
            .order_by_asc(serial_unit::Column::ReceivedAt)
            .order_by_asc(serial_unit::Column::Id)
            .limit((wanted - assigned.len()) as u64)
            .all(conn)
            .await?;
        if candidates.is_empty() {
            break;
        }

        for unit in candidates {
            // Another reservation may have taken the unit since the select
            if flip_status(
                conn,
                unit.id,
                SerialUnitStatus::InStock,
                SerialUnitStatus::Reserved,
                Some(Some(order_line_id)),
            )
            .await?
            {
                assigned.push(unit.id);
            }
        }
    }

    if assigned.len() < wanted {
        error!(
            sku_id = %sku_id,
            requested = quantity,
            assigned = assigned.len(),
            "Ledger reserved stock that has no matching in-stock serial units"
        );
        return Err(ServiceError::IntegrityViolation(format!(
            "Only {} of {} serial units of {} are in stock",
            assigned.len(),
            quantity,
            sku_id
        )));
    }
    Ok(assigned)
}

/// Reserves one caller-chosen unit for an order line.
pub async fn reserve_specific_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    sku_id: &str,
    order_line_id: Uuid,
) -> Result<(), ServiceError> {
    let unit = load_unit(conn, unit_id).await?;
    if unit.sku_id != sku_id {
        return Err(ServiceError::ValidationError(format!(
            "Serial unit {} belongs to {}, not {}",
            unit.identifier, unit.sku_id, sku_id
        )));
    }
    if !flip_status(
        conn,
        unit_id,
        SerialUnitStatus::InStock,
        SerialUnitStatus::Reserved,
        Some(Some(order_line_id)),
    )
    .await?
    {
        return Err(ServiceError::InvalidOperation(format!(
            "Serial unit {} is not in stock",
            unit.identifier
        )));
    }
    Ok(())
}

/// RESERVED -> SOLD. A unit that is not reserved means a prior step went wrong.
pub async fn mark_sold_in<C: ConnectionTrait>(conn: &C, unit_id: Uuid) -> Result<(), ServiceError> {
    if !flip_status(
        conn,
        unit_id,
        SerialUnitStatus::Reserved,
        SerialUnitStatus::Sold,
        None,
    )
    .await?
    {
        let status = SerialUnitEntity::find_by_id(unit_id)
            .one(conn)
            .await?
            .map(|u| u.status.to_string());
        error!(unit_id = %unit_id, status = ?status, "Selling a serial unit that is not reserved");
        return Err(ServiceError::IntegrityViolation(format!(
            "Serial unit {} is not reserved",
            unit_id
        )));
    }
    Ok(())
}

/// RESERVED -> IN_STOCK. Returns false, with a warning, when the unit was not reserved.
pub async fn release_unit_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
) -> Result<bool, ServiceError> {
    let released = flip_status(
        conn,
        unit_id,
        SerialUnitStatus::Reserved,
        SerialUnitStatus::InStock,
        Some(None),
    )
    .await?;
    if !released {
        warn!(unit_id = %unit_id, "Release requested for a serial unit that is not reserved");
    }
    Ok(released)
}

/// SOLD -> RETURNED. The unit stays off the shelf until restocked.
pub async fn mark_returned_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
) -> Result<(), ServiceError> {
    if !flip_status(
        conn,
        unit_id,
        SerialUnitStatus::Sold,
        SerialUnitStatus::Returned,
        None,
    )
    .await?
    {
        let unit = load_unit(conn, unit_id).await?;
        return Err(ServiceError::InvalidOperation(format!(
            "Serial unit {} is {}, only SOLD units can be returned",
            unit.identifier, unit.status
        )));
    }
    Ok(())
}

/// Units held by an order line, oldest first.
pub async fn units_for_line_in<C: ConnectionTrait>(
    conn: &C,
    order_line_id: Uuid,
) -> Result<Vec<serial_unit::Model>, ServiceError> {
    Ok(SerialUnitEntity::find()
        .filter(serial_unit::Column::OrderLineId.eq(order_line_id))
        .order_by_asc(serial_unit::Column::ReceivedAt)
        .order_by_asc(serial_unit::Column::Id)
        .all(conn)
        .await?)
}

/// Serial Unit Tracker: per-unit status layered over the stock ledger.
#[derive(Clone)]
pub struct SerialUnitService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl SerialUnitService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn begin(&self) -> Result<DatabaseTransaction, ServiceError> {
        self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start serial unit transaction");
            ServiceError::DatabaseError(e)
        })
    }

    /// Registers a newly received unit and books it into the ledger.
    #[instrument(skip(self))]
    pub async fn register_unit(
        &self,
        sku_id: &str,
        identifier: &str,
        actor: Option<Uuid>,
    ) -> Result<serial_unit::Model, ServiceError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(ServiceError::ValidationError(
                "Serial identifier must not be empty".to_string(),
            ));
        }
        if self.find_by_identifier(identifier).await?.is_some() {
            return Err(ServiceError::ValidationError(format!(
                "Serial identifier {} is already registered",
                identifier
            )));
        }

        let txn = self.begin().await?;
        let now = Utc::now();
        let unit = serial_unit::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku_id: Set(sku_id.to_string()),
            identifier: Set(identifier.to_string()),
            status: Set(SerialUnitStatus::InStock),
            order_line_id: Set(None),
            received_at: Set(now),
            sold_at: Set(None),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::ValidationError(format!(
                    "Serial identifier {} is already registered",
                    identifier
                ))
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;

        let ctx = MovementContext::new()
            .created_by(actor)
            .with_serial_unit(unit.id);
        stock_ledger::receive_in(&txn, sku_id, 1, MovementReason::Purchase, &ctx).await?;
        txn.commit().await?;

        info!(unit_id = %unit.id, sku_id = %sku_id, identifier = %identifier, "Serial unit registered");
        publish(
            &self.event_sender,
            Event::SerialUnitRegistered {
                unit_id: unit.id,
                sku_id: sku_id.to_string(),
            },
        )
        .await;
        Ok(unit)
    }

    /// Reserves `quantity` of a serialized SKU and the matching units in one scope.
    #[instrument(skip(self))]
    pub async fn assign_for_reservation(
        &self,
        sku_id: &str,
        quantity: i32,
        order_line_id: Uuid,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let txn = self.begin().await?;
        match stock_ledger::reserve_in(&txn, sku_id, quantity).await? {
            ReserveOutcome::Reserved { .. } => {}
            ReserveOutcome::Insufficient { available } => {
                txn.rollback().await?;
                return Err(ServiceError::InsufficientStock {
                    sku_id: sku_id.to_string(),
                    requested: quantity,
                    available,
                });
            }
        }
        let units = assign_for_reservation_in(&txn, sku_id, quantity, order_line_id).await?;
        txn.commit().await?;
        Ok(units)
    }

    /// Reserves one caller-chosen unit together with a ledger reservation of one.
    #[instrument(skip(self))]
    pub async fn reserve_specific(
        &self,
        unit_id: Uuid,
        order_line_id: Uuid,
    ) -> Result<serial_unit::Model, ServiceError> {
        let txn = self.begin().await?;
        let unit = load_unit(&txn, unit_id).await?;
        if let ReserveOutcome::Insufficient { available } =
            stock_ledger::reserve_in(&txn, &unit.sku_id, 1).await?
        {
            txn.rollback().await?;
            return Err(ServiceError::InsufficientStock {
                sku_id: unit.sku_id,
                requested: 1,
                available,
            });
        }
        reserve_specific_in(&txn, unit_id, &unit.sku_id, order_line_id).await?;
        let reserved = load_unit(&txn, unit_id).await?;
        txn.commit().await?;
        Ok(reserved)
    }

    /// Sells a reserved unit: ledger commit plus RESERVED -> SOLD.
    #[instrument(skip(self, ctx))]
    pub async fn mark_sold(&self, unit_id: Uuid, ctx: MovementContext) -> Result<(), ServiceError> {
        let txn = self.begin().await?;
        let unit = load_unit(&txn, unit_id).await?;
        mark_sold_in(&txn, unit_id).await?;
        stock_ledger::commit_in(&txn, &unit.sku_id, 1, &ctx.with_serial_unit(unit_id)).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Puts a reserved unit back on the shelf: ledger release plus RESERVED -> IN_STOCK.
    #[instrument(skip(self))]
    pub async fn release(&self, unit_id: Uuid) -> Result<bool, ServiceError> {
        let txn = self.begin().await?;
        let unit = load_unit(&txn, unit_id).await?;
        let released = release_unit_in(&txn, unit_id).await?;
        if released {
            stock_ledger::release_in(&txn, &unit.sku_id, 1).await?;
        }
        txn.commit().await?;
        Ok(released)
    }

    #[instrument(skip(self))]
    pub async fn mark_returned(&self, unit_id: Uuid) -> Result<serial_unit::Model, ServiceError> {
        let txn = self.begin().await?;
        mark_returned_in(&txn, unit_id).await?;
        let unit = load_unit(&txn, unit_id).await?;
        txn.commit().await?;
        Ok(unit)
    }

    /// RETURNED -> IN_STOCK and one unit back on hand.
    #[instrument(skip(self))]
    pub async fn restock_returned(
        &self,
        unit_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<serial_unit::Model, ServiceError> {
        let txn = self.begin().await?;
        let unit = load_unit(&txn, unit_id).await?;
        if !flip_status(
            &txn,
            unit_id,
            SerialUnitStatus::Returned,
            SerialUnitStatus::InStock,
            Some(None),
        )
        .await?
        {
            return Err(ServiceError::InvalidOperation(format!(
                "Serial unit {} is {}, only RETURNED units can be restocked",
                unit.identifier, unit.status
            )));
        }
        let mut ctx = MovementContext::new()
            .created_by(actor)
            .with_serial_unit(unit_id)
            .with_notes("Returned unit restocked");
        if let Some(order_id) = self.order_for_line(&txn, unit.order_line_id).await? {
            ctx.ref_type = Some(SALES_ORDER_REF.to_string());
            ctx.ref_id = Some(order_id);
        }
        stock_ledger::receive_in(&txn, &unit.sku_id, 1, MovementReason::Return, &ctx).await?;
        let unit = load_unit(&txn, unit_id).await?;
        txn.commit().await?;

        info!(unit_id = %unit_id, sku_id = %unit.sku_id, "Returned serial unit restocked");
        Ok(unit)
    }

    /// IN_STOCK -> DEFECTIVE and one unit written off.
    #[instrument(skip(self))]
    pub async fn mark_defective(
        &self,
        unit_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<serial_unit::Model, ServiceError> {
        let txn = self.begin().await?;
        let unit = load_unit(&txn, unit_id).await?;
        if !flip_status(
            &txn,
            unit_id,
            SerialUnitStatus::InStock,
            SerialUnitStatus::Defective,
            None,
        )
        .await?
        {
            return Err(ServiceError::InvalidOperation(format!(
                "Serial unit {} is {}, only IN_STOCK units can be marked defective",
                unit.identifier, unit.status
            )));
        }
        let ctx = MovementContext::new()
            .created_by(actor)
            .with_serial_unit(unit_id);
        stock_ledger::issue_in(&txn, &unit.sku_id, 1, MovementReason::Damaged, &ctx).await?;
        let unit = load_unit(&txn, unit_id).await?;
        txn.commit().await?;

        warn!(unit_id = %unit_id, sku_id = %unit.sku_id, "Serial unit marked defective");
        Ok(unit)
    }

    async fn order_for_line<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_line_id: Option<Uuid>,
    ) -> Result<Option<Uuid>, ServiceError> {
        let Some(line_id) = order_line_id else {
            return Ok(None);
        };
        Ok(crate::entities::sales_order_line::Entity::find_by_id(line_id)
            .one(conn)
            .await?
            .map(|line| line.order_id))
    }

    pub async fn get_unit(&self, unit_id: Uuid) -> Result<Option<serial_unit::Model>, ServiceError> {
        Ok(SerialUnitEntity::find_by_id(unit_id)
            .one(&*self.db_pool)
            .await?)
    }

    pub async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<serial_unit::Model>, ServiceError> {
        Ok(SerialUnitEntity::find()
            .filter(serial_unit::Column::Identifier.eq(identifier))
            .one(&*self.db_pool)
            .await?)
    }

    pub async fn list_for_sku(&self, sku_id: &str) -> Result<Vec<serial_unit::Model>, ServiceError> {
        Ok(SerialUnitEntity::find()
            .filter(serial_unit::Column::SkuId.eq(sku_id))
            .order_by_asc(serial_unit::Column::ReceivedAt)
            .order_by_asc(serial_unit::Column::Id)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn list_by_status(
        &self,
        status: SerialUnitStatus,
    ) -> Result<Vec<serial_unit::Model>, ServiceError> {
        Ok(SerialUnitEntity::find()
            .filter(serial_unit::Column::Status.eq(status))
            .order_by_asc(serial_unit::Column::SkuId)
            .order_by_asc(serial_unit::Column::ReceivedAt)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn units_for_line(
        &self,
        order_line_id: Uuid,
    ) -> Result<Vec<serial_unit::Model>, ServiceError> {
        units_for_line_in(&*self.db_pool, order_line_id).await
    }

    /// Compares unit counts with the ledger counters for a serialized SKU.
    /// Drift is logged and reported; repairing it is a maintenance task.
    #[instrument(skip(self))]
    pub async fn check_invariant(&self, sku_id: &str) -> Result<SerialReconciliation, ServiceError> {
        let db = &*self.db_pool;
        let count_status = |status: SerialUnitStatus| {
            SerialUnitEntity::find()
                .filter(serial_unit::Column::SkuId.eq(sku_id))
                .filter(serial_unit::Column::Status.eq(status))
                .count(db)
        };
        let in_stock_units = count_status(SerialUnitStatus::InStock).await?;
        let reserved_units = count_status(SerialUnitStatus::Reserved).await?;

        let (available_quantity, reserved_quantity) = stock_ledger::find_item(db, sku_id)
            .await?
            .map(|item| (item.available_quantity(), item.reserved_quantity))
            .unwrap_or((0, 0));

        let report = SerialReconciliation {
            sku_id: sku_id.to_string(),
            in_stock_units,
            reserved_units,
            available_quantity,
            reserved_quantity,
        };
        if !report.is_consistent() {
            error!(
                sku_id = %sku_id,
                in_stock_units,
                reserved_units,
                available_quantity,
                reserved_quantity,
                "Serial unit counts disagree with stock counters"
            );
        }
        Ok(report)
    }
}
