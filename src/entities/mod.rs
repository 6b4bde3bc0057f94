pub mod installment_plan;
pub mod payment;
pub mod sales_order;
pub mod sales_order_line;
pub mod serial_unit;
pub mod stock_item;
pub mod stock_movement;
