use std::{str::FromStr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use retail_core::{
    config,
    db::{self, DbPool},
    entities::{installment_plan, sales_order, stock_item, stock_movement::MovementReason},
    errors::ServiceError,
    events::{self, EventSender},
    metrics,
    services::{
        catalog::{InMemoryCatalog, InMemoryCustomers},
        reservation_coordinator::TransitionRequest,
        stock_ledger::MovementContext,
    },
    AppServices,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        if let Some(service_err) = err.downcast_ref::<ServiceError>() {
            error!(error = %service_err, "Command failed");
            eprintln!(
                "error [{}]: {}",
                service_err.category(),
                service_err.public_message()
            );
            std::process::exit(1);
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::Stock(command) => handle_stock_command(&context, command, &cli.global).await?,
        Commands::Serial(command) => handle_serial_command(&context, command, &cli.global).await?,
        Commands::Orders(command) => handle_orders_command(&context, command, &cli.global).await?,
        Commands::Plans(command) => handle_plans_command(&context, command, &cli.global).await?,
        Commands::Metrics => print!("{}", metrics::gather_text()),
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "retail-cli", about = "Operator tooling for orders, stock and installment plans", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[arg(long, global = true, value_parser = clap::value_parser!(Uuid), help = "Acting user recorded on movements")]
    actor: Option<Uuid>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    #[command(subcommand)]
    Stock(StockCommands),
    #[command(subcommand)]
    Serial(SerialCommands),
    #[command(subcommand)]
    Orders(OrdersCommands),
    #[command(subcommand)]
    Plans(PlansCommands),
    /// Print prometheus metrics collected by this process
    Metrics,
}

#[derive(Subcommand)]
enum StockCommands {
    Show { sku: String },
    Receive {
        sku: String,
        #[arg(value_parser = parse_positive_i32)]
        quantity: i32,
        #[arg(long, value_enum, default_value_t = InboundReason::Purchase)]
        reason: InboundReason,
        #[arg(long)]
        notes: Option<String>,
    },
    Adjust {
        sku: String,
        new_quantity: i32,
        #[arg(long)]
        notes: Option<String>,
    },
    /// SKUs at or below their minimum stock
    Low,
    Movements { sku: String },
    /// Replay the movement log and compare it with the counters
    Reconcile { sku: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum InboundReason {
    Purchase,
    Return,
    Transfer,
    Adjustment,
}

impl From<InboundReason> for MovementReason {
    fn from(reason: InboundReason) -> Self {
        match reason {
            InboundReason::Purchase => MovementReason::Purchase,
            InboundReason::Return => MovementReason::Return,
            InboundReason::Transfer => MovementReason::Transfer,
            InboundReason::Adjustment => MovementReason::Adjustment,
        }
    }
}

#[derive(Subcommand)]
enum SerialCommands {
    Register { sku: String, identifier: String },
    Show { identifier: String },
    /// Compare unit statuses with the stock counters of a serialized SKU
    Check { sku: String },
}

#[derive(Subcommand)]
enum OrdersCommands {
    /// Show an order by id or order number
    Show { order: String },
    Confirm(TransitionArgs),
    Pay(TransitionArgs),
    Cancel(TransitionArgs),
    Refund(TransitionArgs),
}

#[derive(Args)]
struct TransitionArgs {
    #[arg(value_parser = clap::value_parser!(Uuid))]
    order_id: Uuid,
    #[arg(long, help = "Fail unless the order is still at this version")]
    version: Option<i32>,
}

#[derive(Subcommand)]
enum PlansCommands {
    Show {
        #[arg(value_parser = clap::value_parser!(Uuid))]
        plan_id: Uuid,
    },
    Pay {
        #[arg(value_parser = clap::value_parser!(Uuid))]
        plan_id: Uuid,
        #[arg(value_parser = parse_decimal)]
        amount: Decimal,
    },
    Default {
        #[arg(value_parser = clap::value_parser!(Uuid))]
        plan_id: Uuid,
    },
    Stats,
}

struct CliContext {
    db: Arc<DbPool>,
    services: AppServices,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::connect(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);
        if config.auto_migrate {
            db::run_migrations(&db)
                .await
                .context("failed to run migrations")?;
        }

        let (event_sender, event_rx) = EventSender::channel(config.event_channel_capacity);
        tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(
            &config,
            db.clone(),
            Some(Arc::new(event_sender)),
            Arc::new(InMemoryCatalog::new()),
            Arc::new(InMemoryCustomers::new()),
        );

        debug!(environment = %config.environment, "CLI context initialized");
        Ok(Self { db, services })
    }
}

async fn handle_stock_command(
    context: &CliContext,
    command: StockCommands,
    global: &GlobalArgs,
) -> Result<()> {
    let stock = &context.services.stock;
    let ctx = |notes: Option<String>| {
        let ctx = MovementContext::new().created_by(global.actor);
        match notes {
            Some(notes) => ctx.with_notes(notes),
            None => ctx,
        }
    };

    match command {
        StockCommands::Show { sku } => {
            let item = stock
                .get_stock(&sku)
                .await?
                .ok_or_else(|| anyhow!("no stock record for {}", sku))?;
            output(global, &item, render_stock_item)?;
        }
        StockCommands::Receive {
            sku,
            quantity,
            reason,
            notes,
        } => {
            let item = stock.receive(&sku, quantity, reason.into(), ctx(notes)).await?;
            output(global, &item, render_stock_item)?;
        }
        StockCommands::Adjust {
            sku,
            new_quantity,
            notes,
        } => match stock.adjust(&sku, new_quantity, ctx(notes)).await? {
            Some(movement) => output(global, &movement, |m| {
                println!("Adjusted {}: {} {}", m.sku_id, m.movement_type, m.quantity)
            })?,
            None => println!("{} already at {}; nothing recorded", sku, new_quantity),
        },
        StockCommands::Low => {
            let items = stock.list_low_stock().await?;
            output(global, &items, |items| items.iter().for_each(render_stock_item))?;
        }
        StockCommands::Movements { sku } => {
            let movements = stock.movements_for_sku(&sku).await?;
            output(global, &movements, |movements| {
                for m in movements {
                    println!(
                        "- {} {} {} {} ref={}",
                        m.created_at.format("%Y-%m-%d %H:%M"),
                        m.movement_type,
                        m.quantity,
                        m.reason,
                        m.ref_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into())
                    );
                }
            })?;
        }
        StockCommands::Reconcile { sku } => {
            let report = stock.reconcile(&sku).await?;
            output(global, &report, |r| {
                println!(
                    "{}: ledger {} vs counter {} over {} movements ({})",
                    r.sku_id,
                    r.ledger_quantity,
                    r.recorded_quantity,
                    r.movement_count,
                    if r.is_consistent() { "ok" } else { "MISMATCH" }
                )
            })?;
        }
    }
    Ok(())
}

async fn handle_serial_command(
    context: &CliContext,
    command: SerialCommands,
    global: &GlobalArgs,
) -> Result<()> {
    let units = &context.services.serial_units;
    match command {
        SerialCommands::Register { sku, identifier } => {
            let unit = units.register_unit(&sku, &identifier, global.actor).await?;
            output(global, &unit, |u| {
                println!("Registered {} ({}) for {}", u.identifier, u.id, u.sku_id)
            })?;
        }
        SerialCommands::Show { identifier } => {
            let unit = units
                .find_by_identifier(&identifier)
                .await?
                .ok_or_else(|| anyhow!("no serial unit {}", identifier))?;
            output(global, &unit, |u| {
                println!("{} • {} • {} • line {:?}", u.identifier, u.sku_id, u.status, u.order_line_id)
            })?;
        }
        SerialCommands::Check { sku } => {
            let report = units.check_invariant(&sku).await?;
            output(global, &report, |r| {
                println!(
                    "{}: in stock {} / available {}, reserved {} / {} ({})",
                    r.sku_id,
                    r.in_stock_units,
                    r.available_quantity,
                    r.reserved_units,
                    r.reserved_quantity,
                    if r.is_consistent() { "ok" } else { "MISMATCH" }
                )
            })?;
        }
    }
    Ok(())
}

async fn handle_orders_command(
    context: &CliContext,
    command: OrdersCommands,
    global: &GlobalArgs,
) -> Result<()> {
    let coordinator = &context.services.coordinator;
    let request = |args: &TransitionArgs| {
        let mut request = TransitionRequest::new(args.order_id);
        if let Some(actor) = global.actor {
            request = request.acting_as(actor);
        }
        if let Some(version) = args.version {
            request = request.at_version(version);
        }
        request
    };

    let order = match command {
        OrdersCommands::Show { order } => {
            let orders = &context.services.orders;
            let id = match Uuid::from_str(&order) {
                Ok(id) => id,
                Err(_) => {
                    orders
                        .get_by_number(&order)
                        .await?
                        .ok_or_else(|| anyhow!("no order {}", order))?
                        .id
                }
            };
            let detail = orders.get_order_with_lines(id).await?;
            return output(global, &detail, |d| {
                render_order(&d.order);
                for line in &d.lines {
                    println!(
                        "  • {} x {} @ {} - {} = {}",
                        line.quantity, line.sku_id, line.unit_price, line.discount_amount, line.line_total
                    );
                }
            });
        }
        OrdersCommands::Confirm(args) => coordinator.confirm(request(&args)).await?,
        OrdersCommands::Pay(args) => coordinator.pay(request(&args)).await?,
        OrdersCommands::Cancel(args) => coordinator.cancel(request(&args)).await?,
        OrdersCommands::Refund(args) => coordinator.refund(request(&args)).await?,
    };
    output(global, &order, render_order)
}

async fn handle_plans_command(
    context: &CliContext,
    command: PlansCommands,
    global: &GlobalArgs,
) -> Result<()> {
    let plans = &context.services.installments;
    match command {
        PlansCommands::Show { plan_id } => {
            let plan = plans
                .get_plan(plan_id)
                .await?
                .ok_or_else(|| anyhow!("no installment plan {}", plan_id))?;
            output(global, &plan, render_plan)?;
        }
        PlansCommands::Pay { plan_id, amount } => {
            let plan = plans.apply_payment(plan_id, amount).await?;
            output(global, &plan, render_plan)?;
        }
        PlansCommands::Default { plan_id } => {
            let plan = plans.mark_defaulted(plan_id).await?;
            output(global, &plan, render_plan)?;
        }
        PlansCommands::Stats => {
            let stats = plans.statistics().await?;
            output(global, &stats, |s| {
                println!(
                    "{} plans: {} active, {} completed, {} defaulted, {} cancelled",
                    s.total_plans, s.active_plans, s.completed_plans, s.defaulted_plans, s.cancelled_plans
                );
                println!("principal {} • outstanding {}", s.total_principal, s.total_outstanding);
            })?;
        }
    }
    Ok(())
}

fn output<T: Serialize>(global: &GlobalArgs, value: &T, render: impl FnOnce(&T)) -> Result<()> {
    if global.json {
        print_json(value)
    } else {
        render(value);
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_stock_item(item: &stock_item::Model) {
    println!(
        "- {} • on hand {} • reserved {} • available {} • min {}",
        item.sku_id,
        item.quantity_on_hand,
        item.reserved_quantity,
        item.available_quantity(),
        item.min_stock
    );
}

fn render_order(order: &sales_order::Model) {
    println!(
        "- Order {} ({}) • status {} • subtotal {} • tax {} • discount {} • total {} • v{}",
        order.order_number,
        order.id,
        order.status,
        order.subtotal,
        order.tax_amount,
        order.discount,
        order.total,
        order.version
    );
}

fn render_plan(plan: &installment_plan::Model) {
    println!(
        "- Plan {} • order {} • {} • {} x {} • remaining {} • next due {}",
        plan.id,
        plan.order_id,
        plan.status,
        plan.months,
        plan.monthly_payment,
        plan.remaining_balance,
        plan.next_payment_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into())
    );
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw).map_err(|_| format!("invalid decimal '{raw}'"))
}

fn parse_positive_i32(raw: &str) -> Result<i32, String> {
    let value: i32 = raw
        .parse()
        .map_err(|_| format!("invalid integer '{raw}'"))?;
    if value <= 0 {
        Err("value must be greater than zero".to_string())
    } else {
        Ok(value)
    }
}
