use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_stock_tables::Migration),
            Box::new(m20240101_000002_create_serial_units_table::Migration),
            Box::new(m20240101_000003_create_sales_order_tables::Migration),
            Box::new(m20240101_000004_create_installment_plans_table::Migration),
            Box::new(m20240101_000005_create_payments_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_stock_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockItems::SkuId)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockItems::QuantityOnHand)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockItems::ReservedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockItems::MinStock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(StockItems::MaxStock).integer().null())
                        .col(
                            ColumnDef::new(StockItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::col(StockItems::QuantityOnHand).gte(0))
                        .check(Expr::col(StockItems::ReservedQuantity).gte(0))
                        .check(
                            Expr::col(StockItems::ReservedQuantity)
                                .lte(Expr::col(StockItems::QuantityOnHand)),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::SkuId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::MovementType)
                                .string_len(8)
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(StockMovements::Reason)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::SerialUnitId).uuid().null())
                        .col(ColumnDef::new(StockMovements::RefType).string_len(32).null())
                        .col(ColumnDef::new(StockMovements::RefId).uuid().null())
                        .col(ColumnDef::new(StockMovements::Notes).text().null())
                        .col(ColumnDef::new(StockMovements::CreatedBy).uuid().null())
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::col(StockMovements::Quantity).gt(0))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_sku_id")
                        .table(StockMovements::Table)
                        .col(StockMovements::SkuId)
                        .col(StockMovements::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_ref")
                        .table(StockMovements::Table)
                        .col(StockMovements::RefType)
                        .col(StockMovements::RefId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(StockItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockItems {
        Table,
        SkuId,
        QuantityOnHand,
        ReservedQuantity,
        MinStock,
        MaxStock,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum StockMovements {
        Table,
        Id,
        SkuId,
        MovementType,
        Quantity,
        Reason,
        SerialUnitId,
        RefType,
        RefId,
        Notes,
        CreatedBy,
        CreatedAt,
    }
}

mod m20240101_000002_create_serial_units_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_serial_units_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SerialUnits::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SerialUnits::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SerialUnits::SkuId).string_len(64).not_null())
                        .col(
                            ColumnDef::new(SerialUnits::Identifier)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(ColumnDef::new(SerialUnits::Status).string_len(16).not_null())
                        .col(ColumnDef::new(SerialUnits::OrderLineId).uuid().null())
                        .col(
                            ColumnDef::new(SerialUnits::ReceivedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SerialUnits::SoldAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SerialUnits::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_serial_units_identifier")
                        .table(SerialUnits::Table)
                        .col(SerialUnits::Identifier)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_serial_units_sku_status")
                        .table(SerialUnits::Table)
                        .col(SerialUnits::SkuId)
                        .col(SerialUnits::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SerialUnits::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SerialUnits {
        Table,
        Id,
        SkuId,
        Identifier,
        Status,
        OrderLineId,
        ReceivedAt,
        SoldAt,
        UpdatedAt,
    }
}

mod m20240101_000003_create_sales_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_sales_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SalesOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesOrders::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::OrderNumber)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrders::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(SalesOrders::CreatedBy).uuid().not_null())
                        .col(ColumnDef::new(SalesOrders::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(SalesOrders::PaymentMethod)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::Subtotal)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::Discount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::TaxAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::Total)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(SalesOrders::Notes).text().null())
                        .col(
                            ColumnDef::new(SalesOrders::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::ConfirmedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::RefundedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_orders_order_number")
                        .table(SalesOrders::Table)
                        .col(SalesOrders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_orders_customer_id")
                        .table(SalesOrders::Table)
                        .col(SalesOrders::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_orders_status")
                        .table(SalesOrders::Table)
                        .col(SalesOrders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SalesOrderLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesOrderLines::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrderLines::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(SalesOrderLines::SkuId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrderLines::SerialUnitId).uuid().null())
                        .col(
                            ColumnDef::new(SalesOrderLines::Serialized)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::UnitPrice)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::CostPrice)
                                .decimal_len(16, 4)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::DiscountAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::LineTotal)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::col(SalesOrderLines::Quantity).gt(0))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_sales_order_lines_order_id")
                                .from(SalesOrderLines::Table, SalesOrderLines::OrderId)
                                .to(SalesOrders::Table, SalesOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_order_lines_order_id")
                        .table(SalesOrderLines::Table)
                        .col(SalesOrderLines::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SalesOrderLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SalesOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SalesOrders {
        Table,
        Id,
        OrderNumber,
        CustomerId,
        CreatedBy,
        Status,
        PaymentMethod,
        Subtotal,
        Discount,
        TaxAmount,
        Total,
        Notes,
        Version,
        CreatedAt,
        UpdatedAt,
        ConfirmedAt,
        PaidAt,
        CancelledAt,
        RefundedAt,
    }

    #[derive(DeriveIden)]
    enum SalesOrderLines {
        Table,
        Id,
        OrderId,
        SkuId,
        SerialUnitId,
        Serialized,
        Quantity,
        UnitPrice,
        CostPrice,
        DiscountAmount,
        LineTotal,
        CreatedAt,
    }
}

mod m20240101_000004_create_installment_plans_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_installment_plans_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InstallmentPlans::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InstallmentPlans::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InstallmentPlans::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(InstallmentPlans::Provider)
                                .string_len(64)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InstallmentPlans::Principal)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InstallmentPlans::DownPayment)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(InstallmentPlans::Months).integer().not_null())
                        .col(
                            ColumnDef::new(InstallmentPlans::AnnualRate)
                                .decimal_len(9, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InstallmentPlans::MonthlyPayment)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InstallmentPlans::RemainingBalance)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InstallmentPlans::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(InstallmentPlans::StartDate).date().not_null())
                        .col(
                            ColumnDef::new(InstallmentPlans::NextPaymentDate)
                                .date()
                                .null(),
                        )
                        .col(ColumnDef::new(InstallmentPlans::EndDate).date().null())
                        .col(
                            ColumnDef::new(InstallmentPlans::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InstallmentPlans::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One plan per order
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_installment_plans_order_id")
                        .table(InstallmentPlans::Table)
                        .col(InstallmentPlans::OrderId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InstallmentPlans::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum InstallmentPlans {
        Table,
        Id,
        OrderId,
        Provider,
        Principal,
        DownPayment,
        Months,
        AnnualRate,
        MonthlyPayment,
        RemainingBalance,
        Status,
        StartDate,
        NextPaymentDate,
        EndDate,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000005_create_payments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Payments::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Amount).decimal_len(16, 4).not_null())
                        .col(ColumnDef::new(Payments::Method).string_len(16).not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Payments::PaidAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::RefundedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_order_id")
                        .table(Payments::Table)
                        .col(Payments::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        Amount,
        Method,
        Status,
        PaidAt,
        RefundedAt,
    }
}
