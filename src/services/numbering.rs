use chrono::NaiveDate;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};

use crate::entities::sales_order;
use crate::errors::ServiceError;

const SEQUENCE_WIDTH: usize = 6;

/// Format: {PREFIX}{YYYYMMDD}{SEQUENCE}
/// Example: SO20240315000042
pub fn format_order_number(prefix: &str, date: NaiveDate, sequence: u32) -> String {
    format!(
        "{}{}{:0width$}",
        prefix,
        date.format("%Y%m%d"),
        sequence,
        width = SEQUENCE_WIDTH
    )
}

/// Sequence part of a number issued for `prefix` on `date`, if it is one.
pub fn parse_sequence(order_number: &str, prefix: &str, date: NaiveDate) -> Option<u32> {
    let day_prefix = format!("{}{}", prefix, date.format("%Y%m%d"));
    order_number
        .strip_prefix(&day_prefix)
        .filter(|rest| rest.len() >= SEQUENCE_WIDTH && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

/// Next free number for the day. Uniqueness is still enforced by the index on
/// `order_number`; callers retry when a concurrent insert takes the same one.
pub async fn next_order_number<C: ConnectionTrait>(
    conn: &C,
    prefix: &str,
    date: NaiveDate,
) -> Result<String, ServiceError> {
    let day_prefix = format!("{}{}", prefix, date.format("%Y%m%d"));
    let latest = sales_order::Entity::find()
        .select_only()
        .column(sales_order::Column::OrderNumber)
        .filter(sales_order::Column::OrderNumber.starts_with(&day_prefix))
        .order_by_desc(sales_order::Column::OrderNumber)
        .limit(1)
        .into_tuple::<String>()
        .one(conn)
        .await?;

    let next = latest
        .as_deref()
        .and_then(|number| parse_sequence(number, prefix, date))
        .map_or(1, |seq| seq + 1);
    Ok(format_order_number(prefix, date, next))
}
