// Collaborator seams
pub mod catalog;

// Inventory
pub mod serial_units;
pub mod stock_ledger;

// Orders
pub mod numbering;
pub mod order_state;
pub mod orders;
pub mod reservation_coordinator;

// Financing
pub mod installments;
