#![allow(dead_code)]

use std::sync::Arc;

use retail_core::{
    config::AppConfig,
    db::{self, DbPool},
    entities::sales_order::PaymentMethod,
    entities::serial_unit,
    entities::stock_movement::MovementReason,
    events::{self, EventSender},
    services::catalog::{InMemoryCatalog, InMemoryCustomers, SkuSnapshot},
    services::orders::{CreateOrderRequest, NewOrderLine, OrderWithLines},
    services::stock_ledger::MovementContext,
    AppServices,
};
use rust_decimal::Decimal;
use tempfile::TempDir;
use uuid::Uuid;

/// Services wired against a fresh SQLite database.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub services: AppServices,
    pub catalog: Arc<InMemoryCatalog>,
    pub customers: Arc<InMemoryCustomers>,
    pub clerk: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: Option<TempDir>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        // every connection to sqlite::memory: is its own database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;
        customize(&mut cfg);
        Self::build(cfg, None).await
    }

    /// A WAL-mode database file in a temporary directory, served by a pool of
    /// `connections`, so concurrent transactions really interleave.
    pub async fn file_backed(connections: u32) -> Self {
        let dir = TempDir::new().expect("temp dir for test database");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("retail.db").display());
        let mut cfg = AppConfig::new(url, "test".to_string());
        cfg.db_max_connections = connections;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;
        Self::build(cfg, Some(dir)).await
    }

    async fn build(cfg: AppConfig, db_dir: Option<TempDir>) -> Self {

        let pool = db::connect(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let catalog = Arc::new(InMemoryCatalog::new());
        let customers = Arc::new(InMemoryCustomers::new());
        let services = AppServices::new(
            &cfg,
            db.clone(),
            Some(Arc::new(event_sender)),
            catalog.clone(),
            customers.clone(),
        );

        Self {
            db,
            config: cfg,
            services,
            catalog,
            customers,
            clerk: Uuid::new_v4(),
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    pub fn add_sku(&self, sku_id: &str, unit_price: Decimal) {
        self.catalog.upsert(SkuSnapshot {
            sku_id: sku_id.to_string(),
            name: sku_id.to_string(),
            unit_price,
            cost_price: None,
            serialized: false,
        });
    }

    pub fn add_serialized_sku(&self, sku_id: &str, unit_price: Decimal) {
        self.catalog.upsert(SkuSnapshot {
            sku_id: sku_id.to_string(),
            name: sku_id.to_string(),
            unit_price,
            cost_price: None,
            serialized: true,
        });
    }

    /// Registers the SKU in the catalog and puts `quantity` on hand.
    pub async fn stock_sku(&self, sku_id: &str, unit_price: Decimal, quantity: i32) {
        self.add_sku(sku_id, unit_price);
        self.services
            .stock
            .receive(sku_id, quantity, MovementReason::Purchase, MovementContext::new())
            .await
            .expect("seed stock");
    }

    /// Registers a serialized SKU and one unit per identifier.
    pub async fn stock_serialized(
        &self,
        sku_id: &str,
        unit_price: Decimal,
        identifiers: &[&str],
    ) -> Vec<serial_unit::Model> {
        self.add_serialized_sku(sku_id, unit_price);
        let mut units = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            units.push(
                self.services
                    .serial_units
                    .register_unit(sku_id, identifier, Some(self.clerk))
                    .await
                    .expect("register serial unit"),
            );
        }
        units
    }

    pub fn new_customer(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.customers.register(id);
        id
    }

    pub fn order_request(&self, lines: Vec<NewOrderLine>) -> CreateOrderRequest {
        CreateOrderRequest {
            customer_id: self.new_customer(),
            created_by: self.clerk,
            payment_method: PaymentMethod::Card,
            discount: Decimal::ZERO,
            notes: None,
            lines,
        }
    }

    pub async fn draft(&self, lines: Vec<NewOrderLine>) -> OrderWithLines {
        self.services
            .orders
            .create_draft(self.order_request(lines))
            .await
            .expect("create draft order")
    }

    pub async fn on_hand(&self, sku_id: &str) -> (i32, i32) {
        let item = self
            .services
            .stock
            .get_stock(sku_id)
            .await
            .expect("load stock")
            .expect("stock record exists");
        (item.quantity_on_hand, item.reserved_quantity)
    }
}

pub fn line(sku_id: &str, quantity: i32) -> NewOrderLine {
    NewOrderLine {
        sku_id: sku_id.to_string(),
        quantity,
        serial_unit_id: None,
        discount_amount: Decimal::ZERO,
    }
}

pub fn discounted_line(sku_id: &str, quantity: i32, discount: Decimal) -> NewOrderLine {
    NewOrderLine {
        discount_amount: discount,
        ..line(sku_id, quantity)
    }
}

pub fn unit_line(sku_id: &str, unit_id: Uuid) -> NewOrderLine {
    NewOrderLine {
        serial_unit_id: Some(unit_id),
        ..line(sku_id, 1)
    }
}
