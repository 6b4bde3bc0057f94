use crate::{
    db::DbPool,
    entities::installment_plan::{self, Entity as InstallmentPlanEntity, PlanStatus},
    entities::sales_order::OrderStatus,
    errors::{is_unique_violation, ServiceError},
    events::{publish, Event, EventSender},
    metrics,
    services::orders::load_order_in,
};
use chrono::{Months, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const MAX_ANNUAL_RATE: Decimal = Decimal::ONE_HUNDRED;
/// Largest amount a `decimal(16, 4)` money column holds.
pub const MAX_AMOUNT: Decimal = dec!(999999999999.9999);

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePlanRequest {
    pub order_id: Uuid,
    #[validate(length(max = 100, message = "Provider cannot exceed 100 characters"))]
    pub provider: Option<String>,
    /// Amount financed, excluding the down payment.
    pub principal: Decimal,
    #[serde(default)]
    pub down_payment: Decimal,
    #[validate(range(min = 1, max = 120, message = "Months must be between 1 and 120"))]
    pub months: i32,
    /// Nominal annual rate in percent; zero for interest-free plans.
    #[serde(default)]
    pub annual_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InstallmentStatistics {
    pub total_plans: u64,
    pub active_plans: u64,
    pub completed_plans: u64,
    pub defaulted_plans: u64,
    pub cancelled_plans: u64,
    pub total_principal: Decimal,
    pub total_outstanding: Decimal,
}

/// Level monthly payment for an amortized loan, rounded to cents.
/// Interest-free plans split the principal evenly.
pub fn monthly_payment(principal: Decimal, months: i32, annual_rate: Decimal) -> Decimal {
    if months <= 0 {
        return principal;
    }
    let n = Decimal::from(months);
    let payment = if annual_rate.is_zero() {
        principal / n
    } else {
        let r = annual_rate / Decimal::ONE_HUNDRED / Decimal::from(12);
        let mut growth = Decimal::ONE;
        for _ in 0..months {
            growth *= Decimal::ONE + r;
        }
        principal * r * growth / (growth - Decimal::ONE)
    };
    payment.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn one_month_after(date: NaiveDate) -> Result<NaiveDate, ServiceError> {
    date.checked_add_months(Months::new(1))
        .ok_or_else(|| ServiceError::InternalError(format!("Date overflow after {}", date)))
}

fn validate_amounts(request: &CreatePlanRequest) -> Result<(), ServiceError> {
    if request.principal <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Principal must be positive".to_string(),
        ));
    }
    if request.principal > MAX_AMOUNT || request.down_payment > MAX_AMOUNT {
        return Err(ServiceError::ValidationError(format!(
            "Principal and down payment cannot exceed {}",
            MAX_AMOUNT
        )));
    }
    if request.down_payment.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "Down payment cannot be negative".to_string(),
        ));
    }
    if request.annual_rate.is_sign_negative() || request.annual_rate > MAX_ANNUAL_RATE {
        return Err(ServiceError::ValidationError(format!(
            "Annual rate must be between 0 and {}",
            MAX_ANNUAL_RATE
        )));
    }
    Ok(())
}

async fn lock_plan(
    txn: &DatabaseTransaction,
    plan_id: Uuid,
) -> Result<installment_plan::Model, ServiceError> {
    InstallmentPlanEntity::find_by_id(plan_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Installment plan {} not found", plan_id)))
}

fn require_active(plan: &installment_plan::Model, action: &str) -> Result<(), ServiceError> {
    if plan.status != PlanStatus::Active {
        return Err(ServiceError::InvalidOperation(format!(
            "Cannot {} installment plan {} while {}",
            action, plan.id, plan.status
        )));
    }
    Ok(())
}

/// Cancels the ACTIVE plan of an order, if there is one. Returns its id.
pub async fn cancel_for_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<Uuid>, ServiceError> {
    let Some(plan) = InstallmentPlanEntity::find()
        .filter(installment_plan::Column::OrderId.eq(order_id))
        .filter(installment_plan::Column::Status.eq(PlanStatus::Active))
        .one(conn)
        .await?
    else {
        return Ok(None);
    };

    let plan_id = plan.id;
    let mut active: installment_plan::ActiveModel = plan.into();
    active.status = Set(PlanStatus::Cancelled);
    active.next_payment_date = Set(None);
    active.end_date = Set(Some(Utc::now().date_naive()));
    active.update(conn).await?;

    info!(plan_id = %plan_id, order_id = %order_id, "Installment plan cancelled with its order");
    Ok(Some(plan_id))
}

/// Installment/Payment Ledger: amortization bookkeeping for orders paid in installments.
#[derive(Clone)]
pub struct InstallmentService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl InstallmentService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn begin(&self) -> Result<DatabaseTransaction, ServiceError> {
        self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start installment transaction");
            ServiceError::DatabaseError(e)
        })
    }

    /// One plan per order. The balance starts at the principal; the first
    /// payment falls due a month after today.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_plan(
        &self,
        request: CreatePlanRequest,
    ) -> Result<installment_plan::Model, ServiceError> {
        request.validate()?;
        validate_amounts(&request)?;

        let txn = self.begin().await?;
        let order = load_order_in(&txn, request.order_id).await?;
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is {}; no installment plan can be opened",
                order.order_number, order.status
            )));
        }
        let existing = InstallmentPlanEntity::find()
            .filter(installment_plan::Column::OrderId.eq(request.order_id))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::DuplicatePlan(request.order_id));
        }

        let today = Utc::now().date_naive();
        let plan = installment_plan::ActiveModel {
            order_id: Set(request.order_id),
            provider: Set(request.provider.clone()),
            principal: Set(request.principal),
            down_payment: Set(request.down_payment),
            months: Set(request.months),
            annual_rate: Set(request.annual_rate),
            monthly_payment: Set(monthly_payment(
                request.principal,
                request.months,
                request.annual_rate,
            )),
            remaining_balance: Set(request.principal),
            status: Set(PlanStatus::Active),
            start_date: Set(today),
            next_payment_date: Set(Some(one_month_after(today)?)),
            end_date: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::DuplicatePlan(request.order_id)
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;
        txn.commit().await?;

        info!(
            plan_id = %plan.id,
            principal = %plan.principal,
            months = plan.months,
            monthly_payment = %plan.monthly_payment,
            "Installment plan created"
        );
        publish(
            &self.event_sender,
            Event::InstallmentPlanCreated {
                plan_id: plan.id,
                order_id: plan.order_id,
            },
        )
        .await;
        Ok(plan)
    }

    /// Reduces the balance, floored at zero. A zero balance completes the plan.
    /// The next due date moves one month on whether or not the payment was full.
    #[instrument(skip(self))]
    pub async fn apply_payment(
        &self,
        plan_id: Uuid,
        amount: Decimal,
    ) -> Result<installment_plan::Model, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }
        if amount > MAX_AMOUNT {
            return Err(ServiceError::ValidationError(format!(
                "Payment amount cannot exceed {}",
                MAX_AMOUNT
            )));
        }

        let txn = self.begin().await?;
        let plan = lock_plan(&txn, plan_id).await?;
        require_active(&plan, "pay")?;

        let remaining = (plan.remaining_balance - amount).max(Decimal::ZERO);
        let due_from = plan.next_payment_date.unwrap_or(plan.start_date);
        let next_due = one_month_after(due_from)?;
        let completed = remaining.is_zero();

        let mut active: installment_plan::ActiveModel = plan.into();
        active.remaining_balance = Set(remaining);
        active.next_payment_date = Set(Some(next_due));
        if completed {
            active.status = Set(PlanStatus::Completed);
            active.end_date = Set(Some(Utc::now().date_naive()));
        }
        let plan = active.update(&txn).await?;
        txn.commit().await?;

        metrics::record_installment_payment();
        info!(plan_id = %plan_id, amount = %amount, remaining = %remaining, "Installment payment applied");
        publish(
            &self.event_sender,
            Event::InstallmentPaymentApplied {
                plan_id,
                amount,
                remaining_balance: remaining,
            },
        )
        .await;
        if completed {
            publish(&self.event_sender, Event::InstallmentPlanCompleted(plan_id)).await;
        }
        Ok(plan)
    }

    /// Closes an ACTIVE plan early, e.g. after an off-system lump-sum payment.
    #[instrument(skip(self))]
    pub async fn settle(&self, plan_id: Uuid) -> Result<installment_plan::Model, ServiceError> {
        let txn = self.begin().await?;
        let plan = lock_plan(&txn, plan_id).await?;
        require_active(&plan, "settle")?;

        let mut active: installment_plan::ActiveModel = plan.into();
        active.status = Set(PlanStatus::Completed);
        active.remaining_balance = Set(Decimal::ZERO);
        active.next_payment_date = Set(None);
        active.end_date = Set(Some(Utc::now().date_naive()));
        let plan = active.update(&txn).await?;
        txn.commit().await?;

        info!(plan_id = %plan_id, "Installment plan settled");
        publish(&self.event_sender, Event::InstallmentPlanCompleted(plan_id)).await;
        Ok(plan)
    }

    #[instrument(skip(self))]
    pub async fn mark_defaulted(&self, plan_id: Uuid) -> Result<installment_plan::Model, ServiceError> {
        let txn = self.begin().await?;
        let plan = lock_plan(&txn, plan_id).await?;
        require_active(&plan, "default")?;

        let mut active: installment_plan::ActiveModel = plan.into();
        active.status = Set(PlanStatus::Defaulted);
        active.end_date = Set(Some(Utc::now().date_naive()));
        let plan = active.update(&txn).await?;
        txn.commit().await?;

        warn!(plan_id = %plan_id, outstanding = %plan.remaining_balance, "Installment plan defaulted");
        publish(&self.event_sender, Event::InstallmentPlanDefaulted(plan_id)).await;
        Ok(plan)
    }

    /// Cancels the order's ACTIVE plan outside of an order transition.
    #[instrument(skip(self))]
    pub async fn cancel_for_order(&self, order_id: Uuid) -> Result<Option<Uuid>, ServiceError> {
        let txn = self.begin().await?;
        let cancelled = cancel_for_order_in(&txn, order_id).await?;
        txn.commit().await?;
        if let Some(plan_id) = cancelled {
            publish(&self.event_sender, Event::InstallmentPlanCancelled(plan_id)).await;
        }
        Ok(cancelled)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Option<installment_plan::Model>, ServiceError> {
        Ok(InstallmentPlanEntity::find_by_id(plan_id)
            .one(&*self.db_pool)
            .await?)
    }

    pub async fn plan_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<installment_plan::Model>, ServiceError> {
        Ok(InstallmentPlanEntity::find()
            .filter(installment_plan::Column::OrderId.eq(order_id))
            .one(&*self.db_pool)
            .await?)
    }

    pub async fn list_by_status(
        &self,
        status: PlanStatus,
    ) -> Result<Vec<installment_plan::Model>, ServiceError> {
        Ok(InstallmentPlanEntity::find()
            .filter(installment_plan::Column::Status.eq(status))
            .order_by_asc(installment_plan::Column::NextPaymentDate)
            .order_by_asc(installment_plan::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn statistics(&self) -> Result<InstallmentStatistics, ServiceError> {
        let plans = InstallmentPlanEntity::find().all(&*self.db_pool).await?;
        Ok(summarize(&plans))
    }
}

fn summarize(plans: &[installment_plan::Model]) -> InstallmentStatistics {
    let mut stats = InstallmentStatistics {
        total_plans: plans.len() as u64,
        ..Default::default()
    };
    for plan in plans {
        match plan.status {
            PlanStatus::Active => stats.active_plans += 1,
            PlanStatus::Completed => stats.completed_plans += 1,
            PlanStatus::Defaulted => stats.defaulted_plans += 1,
            PlanStatus::Cancelled => stats.cancelled_plans += 1,
        }
        stats.total_principal += plan.principal;
        stats.total_outstanding += plan.remaining_balance;
    }
    stats
}
