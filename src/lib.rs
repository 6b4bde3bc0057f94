//! Retail order and stock core
//!
//! Sales orders move through a small state machine while the stock they need
//! is reserved, committed or released through an append-only movement ledger.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::catalog::{CatalogService, CustomerDirectory};
use crate::services::installments::InstallmentService;
use crate::services::orders::{OrderService, OrderSettings};
use crate::services::reservation_coordinator::ReservationCoordinator;
use crate::services::serial_units::SerialUnitService;
use crate::services::stock_ledger::StockLedgerService;

/// Every service, built once at start-up and shared by reference.
#[derive(Clone)]
pub struct AppServices {
    pub stock: Arc<StockLedgerService>,
    pub serial_units: Arc<SerialUnitService>,
    pub orders: Arc<OrderService>,
    pub coordinator: Arc<ReservationCoordinator>,
    pub installments: Arc<InstallmentService>,
}

impl AppServices {
    pub fn new(
        config: &AppConfig,
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        catalog: Arc<dyn CatalogService>,
        customers: Arc<dyn CustomerDirectory>,
    ) -> Self {
        let stock = Arc::new(StockLedgerService::new(
            db_pool.clone(),
            event_sender.clone(),
        ));
        let serial_units = Arc::new(SerialUnitService::new(
            db_pool.clone(),
            event_sender.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            catalog,
            customers,
            OrderSettings::from(config),
        ));
        let coordinator = Arc::new(ReservationCoordinator::new(
            db_pool.clone(),
            event_sender.clone(),
            config.refund_restocks_inventory,
        ));
        let installments = Arc::new(InstallmentService::new(db_pool, event_sender));

        Self {
            stock,
            serial_units,
            orders,
            coordinator,
            installments,
        }
    }
}
