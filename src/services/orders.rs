use crate::{
    config::AppConfig,
    db::DbPool,
    entities::sales_order::{self, Entity as SalesOrderEntity, OrderStatus, PaymentMethod},
    entities::sales_order_line::{self, Entity as SalesOrderLineEntity},
    entities::serial_unit::Entity as SerialUnitEntity,
    errors::{is_unique_violation, ServiceError},
    events::{publish, Event, EventSender},
    metrics,
    services::catalog::{CatalogService, CustomerDirectory, SkuSnapshot},
    services::numbering,
    services::order_state::{self, OrderEvent, OrderTotals},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const NUMBER_ATTEMPTS: usize = 5;
const MAX_PER_PAGE: u64 = 100;

/// A line item as requested by the caller; the price comes from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrderLine {
    #[validate(length(min = 1, max = 64, message = "SKU id is required"))]
    pub sku_id: String,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    /// Specific unit of a serialized SKU; requires quantity 1.
    pub serial_unit_id: Option<Uuid>,
    #[serde(default)]
    pub discount_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub created_by: Uuid,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub discount: Decimal,
    #[validate(length(max = 1000, message = "Notes cannot exceed 1000 characters"))]
    pub notes: Option<String>,
    #[serde(default)]
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateLineRequest {
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: Option<i32>,
    pub discount_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateDetailsRequest {
    pub payment_method: Option<PaymentMethod>,
    pub discount: Option<Decimal>,
    #[validate(length(max = 1000, message = "Notes cannot exceed 1000 characters"))]
    pub notes: Option<String>,
    /// Fail with `ConcurrentModification` unless the order is still at this version.
    pub expected_version: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithLines {
    pub order: sales_order::Model,
    pub lines: Vec<sales_order_line::Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<sales_order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Pricing and numbering policy applied to every order.
#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub tax_rate: Decimal,
    pub number_prefix: String,
}

impl From<&AppConfig> for OrderSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            tax_rate: cfg.tax_rate,
            number_prefix: cfg.order_number_prefix.clone(),
        }
    }
}

pub async fn load_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<sales_order::Model, ServiceError> {
    SalesOrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

/// Takes the order row's write lock before anything in the transaction reads
/// it. Concurrent writers to the same order queue here instead of failing on
/// a stale snapshot.
pub async fn claim_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<(), ServiceError> {
    let result = SalesOrderEntity::update_many()
        .col_expr(
            sales_order::Column::Version,
            Expr::col(sales_order::Column::Version).into(),
        )
        .filter(sales_order::Column::Id.eq(order_id))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
    }
    Ok(())
}

/// Lines of an order in ascending SKU order, the order stock is touched in.
pub async fn lines_for_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<sales_order_line::Model>, ServiceError> {
    Ok(SalesOrderLineEntity::find()
        .filter(sales_order_line::Column::OrderId.eq(order_id))
        .order_by_asc(sales_order_line::Column::SkuId)
        .order_by_asc(sales_order_line::Column::CreatedAt)
        .order_by_asc(sales_order_line::Column::Id)
        .all(conn)
        .await?)
}

/// Writes `changes` only if the order is still at `expected_version`, bumping
/// the version in the same statement. Losing the race yields `ConcurrentModification`.
pub async fn versioned_update_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    expected_version: i32,
    mut changes: sales_order::ActiveModel,
) -> Result<sales_order::Model, ServiceError> {
    changes.version = Set(expected_version + 1);
    changes.updated_at = Set(Utc::now());

    let result = SalesOrderEntity::update_many()
        .set(changes)
        .filter(sales_order::Column::Id.eq(order_id))
        .filter(sales_order::Column::Version.eq(expected_version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let current = load_order_in(conn, order_id).await?;
        warn!(
            order_id = %order_id,
            expected_version,
            current_version = current.version,
            "Order changed underneath the caller"
        );
        return Err(ServiceError::ConcurrentModification(order_id));
    }
    load_order_in(conn, order_id).await
}

/// Totals for `lines` under the order's discount and the configured tax rate.
pub fn totals_for(
    lines: &[sales_order_line::Model],
    discount: Decimal,
    tax_rate: Decimal,
) -> OrderTotals {
    order_state::compute_totals(lines.iter().map(|l| l.line_total), discount, tax_rate)
}

fn totals_changes(totals: &OrderTotals) -> sales_order::ActiveModel {
    sales_order::ActiveModel {
        subtotal: Set(totals.subtotal),
        discount: Set(totals.discount),
        tax_amount: Set(totals.tax_amount),
        total: Set(totals.total),
        ..Default::default()
    }
}

fn validate_discount(discount: Decimal) -> Result<(), ServiceError> {
    if discount.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "Order discount cannot be negative".to_string(),
        ));
    }
    Ok(())
}

/// Order Aggregate persistence: drafting, line items and queries. Status changes
/// that touch stock belong to the reservation coordinator.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    catalog: Arc<dyn CatalogService>,
    customers: Arc<dyn CustomerDirectory>,
    settings: OrderSettings,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        catalog: Arc<dyn CatalogService>,
        customers: Arc<dyn CustomerDirectory>,
        settings: OrderSettings,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            catalog,
            customers,
            settings,
        }
    }

    pub fn settings(&self) -> &OrderSettings {
        &self.settings
    }

    async fn begin(&self) -> Result<DatabaseTransaction, ServiceError> {
        self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start order transaction");
            ServiceError::DatabaseError(e)
        })
    }

    async fn snapshot(&self, sku_id: &str) -> Result<SkuSnapshot, ServiceError> {
        self.catalog
            .sku_snapshot(sku_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("SKU {} not found", sku_id)))
    }

    /// Snapshots the catalog price and checks serial-unit rules for one line.
    async fn price_line(
        &self,
        order_id: Uuid,
        line: &NewOrderLine,
    ) -> Result<sales_order_line::ActiveModel, ServiceError> {
        line.validate()?;
        let snapshot = self.snapshot(&line.sku_id).await?;

        if line.serial_unit_id.is_some() {
            if !snapshot.serialized {
                return Err(ServiceError::ValidationError(format!(
                    "SKU {} is not serialized; a serial unit cannot be chosen",
                    line.sku_id
                )));
            }
            if line.quantity != 1 {
                return Err(ServiceError::ValidationError(
                    "A line with a chosen serial unit must have quantity 1".to_string(),
                ));
            }
        }

        let line_total =
            order_state::line_total(line.quantity, snapshot.unit_price, line.discount_amount)?;

        Ok(sales_order_line::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            sku_id: Set(line.sku_id.clone()),
            serial_unit_id: Set(line.serial_unit_id),
            serialized: Set(snapshot.serialized),
            quantity: Set(line.quantity),
            unit_price: Set(snapshot.unit_price),
            cost_price: Set(snapshot.cost_price),
            discount_amount: Set(line.discount_amount),
            line_total: Set(line_total),
            created_at: Set(Utc::now()),
        })
    }

    /// The chosen unit must exist, belong to the SKU and not already sit on this order.
    async fn check_serial_choice<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        sku_id: &str,
        unit_id: Uuid,
    ) -> Result<(), ServiceError> {
        let unit = SerialUnitEntity::find_by_id(unit_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Serial unit {} not found", unit_id)))?;
        if unit.sku_id != sku_id {
            return Err(ServiceError::ValidationError(format!(
                "Serial unit {} belongs to {}, not {}",
                unit.identifier, unit.sku_id, sku_id
            )));
        }
        let already_chosen = SalesOrderLineEntity::find()
            .filter(sales_order_line::Column::OrderId.eq(order_id))
            .filter(sales_order_line::Column::SerialUnitId.eq(unit_id))
            .count(conn)
            .await?;
        if already_chosen > 0 {
            return Err(ServiceError::ValidationError(format!(
                "Serial unit {} is already on this order",
                unit.identifier
            )));
        }
        Ok(())
    }

    /// Creates a DRAFT order with its initial lines.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_draft(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderWithLines, ServiceError> {
        request.validate()?;
        validate_discount(request.discount)?;

        if !self.customers.customer_exists(request.customer_id).await? {
            return Err(ServiceError::NotFound(format!(
                "Customer {} not found",
                request.customer_id
            )));
        }

        let order_id = Uuid::new_v4();
        let mut priced = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            priced.push(self.price_line(order_id, line).await?);
        }

        for attempt in 1..=NUMBER_ATTEMPTS {
            let txn = self.begin().await?;
            match self.insert_draft(&txn, order_id, &request, &priced).await {
                Ok(created) => {
                    txn.commit().await?;
                    info!(
                        order_id = %order_id,
                        order_number = %created.order.order_number,
                        lines = created.lines.len(),
                        "Draft order created"
                    );
                    publish(
                        &self.event_sender,
                        Event::OrderCreated {
                            order_id,
                            order_number: created.order.order_number.clone(),
                        },
                    )
                    .await;
                    return Ok(created);
                }
                Err(ServiceError::DatabaseError(e)) if is_unique_violation(&e) => {
                    txn.rollback().await?;
                    warn!(attempt, "Order number taken by a concurrent insert; retrying");
                }
                Err(e) => {
                    txn.rollback().await?;
                    return Err(e);
                }
            }
        }

        error!(order_id = %order_id, "Could not allocate a unique order number");
        Err(ServiceError::InternalError(
            "Could not allocate a unique order number".to_string(),
        ))
    }

    async fn insert_draft(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        request: &CreateOrderRequest,
        priced: &[sales_order_line::ActiveModel],
    ) -> Result<OrderWithLines, ServiceError> {
        let now = Utc::now();
        let order_number =
            numbering::next_order_number(txn, &self.settings.number_prefix, now.date_naive())
                .await?;

        let order = sales_order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(request.customer_id),
            created_by: Set(request.created_by),
            status: Set(OrderStatus::Draft),
            payment_method: Set(request.payment_method),
            subtotal: Set(Decimal::ZERO),
            discount: Set(request.discount),
            tax_amount: Set(Decimal::ZERO),
            total: Set(Decimal::ZERO),
            notes: Set(request.notes.clone()),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
            confirmed_at: Set(None),
            paid_at: Set(None),
            cancelled_at: Set(None),
            refunded_at: Set(None),
        }
        .insert(txn)
        .await?;

        for (requested, line) in request.lines.iter().zip(priced) {
            if let Some(unit_id) = requested.serial_unit_id {
                self.check_serial_choice(txn, order_id, &requested.sku_id, unit_id)
                    .await?;
            }
            line.clone().insert(txn).await?;
        }

        let lines = lines_for_order_in(txn, order_id).await?;
        let totals = totals_for(&lines, order.discount, self.settings.tax_rate);
        let order = versioned_update_in(txn, order_id, order.version, totals_changes(&totals)).await?;
        Ok(OrderWithLines { order, lines })
    }

    /// Loads an order whose lines may still change.
    async fn editable_order(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<sales_order::Model, ServiceError> {
        claim_order_in(txn, order_id).await?;
        let order = load_order_in(txn, order_id).await?;
        if !order.status.lines_editable() {
            return Err(ServiceError::InvalidOperation(format!(
                "Line items of order {} cannot change while {}",
                order.order_number, order.status
            )));
        }
        Ok(order)
    }

    async fn refresh_totals(
        &self,
        txn: &DatabaseTransaction,
        order: &sales_order::Model,
    ) -> Result<OrderWithLines, ServiceError> {
        let lines = lines_for_order_in(txn, order.id).await?;
        let totals = totals_for(&lines, order.discount, self.settings.tax_rate);
        let order = versioned_update_in(txn, order.id, order.version, totals_changes(&totals)).await?;
        Ok(OrderWithLines { order, lines })
    }

    #[instrument(skip(self, line), fields(sku_id = %line.sku_id))]
    pub async fn add_line(
        &self,
        order_id: Uuid,
        line: NewOrderLine,
    ) -> Result<OrderWithLines, ServiceError> {
        let priced = self.price_line(order_id, &line).await?;

        let txn = self.begin().await?;
        let order = self.editable_order(&txn, order_id).await?;
        if let Some(unit_id) = line.serial_unit_id {
            self.check_serial_choice(&txn, order_id, &line.sku_id, unit_id)
                .await?;
        }
        priced.insert(&txn).await?;
        let updated = self.refresh_totals(&txn, &order).await?;
        txn.commit().await?;

        info!(order_id = %order_id, total = %updated.order.total, "Line added");
        publish(&self.event_sender, Event::OrderUpdated(order_id)).await;
        Ok(updated)
    }

    /// Changes quantity or discount of a line. The unit price stays as snapshotted.
    #[instrument(skip(self, request))]
    pub async fn update_line(
        &self,
        order_id: Uuid,
        line_id: Uuid,
        request: UpdateLineRequest,
    ) -> Result<OrderWithLines, ServiceError> {
        request.validate()?;

        let txn = self.begin().await?;
        let order = self.editable_order(&txn, order_id).await?;
        let line = SalesOrderLineEntity::find_by_id(line_id)
            .filter(sales_order_line::Column::OrderId.eq(order_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Line {} not found", line_id)))?;

        let quantity = request.quantity.unwrap_or(line.quantity);
        let discount_amount = request.discount_amount.unwrap_or(line.discount_amount);
        if line.serial_unit_id.is_some() && quantity != 1 {
            return Err(ServiceError::ValidationError(
                "A line with a chosen serial unit must have quantity 1".to_string(),
            ));
        }
        let line_total = order_state::line_total(quantity, line.unit_price, discount_amount)?;

        let mut active: sales_order_line::ActiveModel = line.into();
        active.quantity = Set(quantity);
        active.discount_amount = Set(discount_amount);
        active.line_total = Set(line_total);
        active.update(&txn).await?;

        let updated = self.refresh_totals(&txn, &order).await?;
        txn.commit().await?;

        info!(order_id = %order_id, line_id = %line_id, total = %updated.order.total, "Line updated");
        publish(&self.event_sender, Event::OrderUpdated(order_id)).await;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn remove_line(
        &self,
        order_id: Uuid,
        line_id: Uuid,
    ) -> Result<OrderWithLines, ServiceError> {
        let txn = self.begin().await?;
        let order = self.editable_order(&txn, order_id).await?;
        let result = SalesOrderLineEntity::delete_many()
            .filter(sales_order_line::Column::Id.eq(line_id))
            .filter(sales_order_line::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Line {} not found", line_id)));
        }

        let updated = self.refresh_totals(&txn, &order).await?;
        txn.commit().await?;

        info!(order_id = %order_id, line_id = %line_id, "Line removed");
        publish(&self.event_sender, Event::OrderUpdated(order_id)).await;
        Ok(updated)
    }

    /// Payment method, order-level discount and notes. Allowed until payment.
    #[instrument(skip(self, request))]
    pub async fn update_details(
        &self,
        order_id: Uuid,
        request: UpdateDetailsRequest,
    ) -> Result<sales_order::Model, ServiceError> {
        request.validate()?;
        if let Some(discount) = request.discount {
            validate_discount(discount)?;
        }

        let txn = self.begin().await?;
        claim_order_in(&txn, order_id).await?;
        let order = load_order_in(&txn, order_id).await?;
        if !order.status.details_editable() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} cannot be edited while {}",
                order.order_number, order.status
            )));
        }
        let expected_version = request.expected_version.unwrap_or(order.version);

        let lines = lines_for_order_in(&txn, order_id).await?;
        let discount = request.discount.unwrap_or(order.discount);
        let mut changes = totals_changes(&totals_for(&lines, discount, self.settings.tax_rate));
        if let Some(method) = request.payment_method {
            changes.payment_method = Set(method);
        }
        if let Some(notes) = request.notes {
            changes.notes = Set(Some(notes));
        }

        let updated = versioned_update_in(&txn, order_id, expected_version, changes).await?;
        txn.commit().await?;

        info!(order_id = %order_id, version = updated.version, "Order details updated");
        publish(&self.event_sender, Event::OrderUpdated(order_id)).await;
        Ok(updated)
    }

    /// DRAFT -> PENDING. An order needs at least one line to be submitted.
    #[instrument(skip(self))]
    pub async fn submit(&self, order_id: Uuid) -> Result<sales_order::Model, ServiceError> {
        let txn = self.begin().await?;
        claim_order_in(&txn, order_id).await?;
        let order = load_order_in(&txn, order_id).await?;
        let next = match order_state::transition(order_id, order.status, OrderEvent::Submit) {
            Ok(next) => next,
            Err(e) => {
                metrics::record_transition(&OrderEvent::Submit.to_string(), false);
                return Err(e);
            }
        };
        let line_count = SalesOrderLineEntity::find()
            .filter(sales_order_line::Column::OrderId.eq(order_id))
            .count(&txn)
            .await?;
        if line_count == 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} has no line items",
                order.order_number
            )));
        }

        let changes = sales_order::ActiveModel {
            status: Set(next),
            ..Default::default()
        };
        let updated = versioned_update_in(&txn, order_id, order.version, changes).await?;
        txn.commit().await?;

        metrics::record_transition(&OrderEvent::Submit.to_string(), true);
        info!(order_id = %order_id, "Order submitted");
        publish(
            &self.event_sender,
            Event::OrderStatusChanged {
                order_id,
                old_status: order.status,
                new_status: next,
            },
        )
        .await;
        Ok(updated)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<sales_order::Model>, ServiceError> {
        Ok(SalesOrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?)
    }

    pub async fn get_order_with_lines(&self, order_id: Uuid) -> Result<OrderWithLines, ServiceError> {
        let db = &*self.db_pool;
        let order = load_order_in(db, order_id).await?;
        let lines = lines_for_order_in(db, order_id).await?;
        Ok(OrderWithLines { order, lines })
    }

    pub async fn get_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<sales_order::Model>, ServiceError> {
        Ok(SalesOrderEntity::find()
            .filter(sales_order::Column::OrderNumber.eq(order_number))
            .one(&*self.db_pool)
            .await?)
    }

    /// Newest first. Pages are 1-based.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        status: Option<OrderStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 || per_page == 0 || per_page > MAX_PER_PAGE {
            return Err(ServiceError::ValidationError(format!(
                "page must be >= 1 and per_page between 1 and {}",
                MAX_PER_PAGE
            )));
        }

        let mut query = SalesOrderEntity::find();
        if let Some(status) = status {
            query = query.filter(sales_order::Column::Status.eq(status));
        }
        let paginator = query
            .order_by_desc(sales_order::Column::CreatedAt)
            .order_by_desc(sales_order::Column::OrderNumber)
            .paginate(&*self.db_pool, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderListResponse {
            orders,
            total,
            page,
            per_page,
        })
    }

    pub async fn list_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<sales_order::Model>, ServiceError> {
        Ok(SalesOrderEntity::find()
            .filter(sales_order::Column::CustomerId.eq(customer_id))
            .order_by_desc(sales_order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }
}
