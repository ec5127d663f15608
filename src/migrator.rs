use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_catalog_tables::Migration),
            Box::new(m20240301_000002_create_orders_tables::Migration),
            Box::new(m20240301_000003_create_payments_table::Migration),
            Box::new(m20240301_000004_create_inventory_ledger_table::Migration),
            Box::new(m20240301_000005_create_cart_and_tracking_tables::Migration),
            Box::new(m20240301_000006_create_reconciliation_issues_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240301_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Medicines::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Medicines::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Medicines::Name).string().not_null())
                        .col(ColumnDef::new(Medicines::Price).decimal_len(16, 4).not_null())
                        .col(
                            ColumnDef::new(Medicines::StockQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Medicines::IsTaxExempt)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Medicines::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Medicines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Medicines::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ShippingMethods::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShippingMethods::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ShippingMethods::Name).string().not_null())
                        .col(
                            ColumnDef::new(ShippingMethods::BaseCost)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(ShippingMethods::EstimatedDays).integer().null())
                        .col(
                            ColumnDef::new(ShippingMethods::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(TaxRates::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(TaxRates::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(TaxRates::Country).string_len(64).not_null())
                        .col(ColumnDef::new(TaxRates::State).string_len(64).null())
                        .col(ColumnDef::new(TaxRates::Rate).decimal_len(9, 4).not_null())
                        .col(
                            ColumnDef::new(TaxRates::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_tax_rates_country")
                        .table(TaxRates::Table)
                        .col(TaxRates::Country)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Coupons::Code).string_len(64).not_null())
                        .col(ColumnDef::new(Coupons::DiscountType).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Coupons::DiscountValue)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::MinPurchaseAmount)
                                .decimal_len(16, 4)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::MaxDiscountAmount)
                                .decimal_len(16, 4)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::ValidFrom)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::ValidUntil)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Coupons::UsageLimit).integer().null())
                        .col(
                            ColumnDef::new(Coupons::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Coupons::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await?;

            // Codes are stored upper-cased; uniqueness is therefore case-insensitive
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(TaxRates::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ShippingMethods::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Medicines::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Medicines {
        Table,
        Id,
        Name,
        Price,
        StockQuantity,
        IsTaxExempt,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ShippingMethods {
        Table,
        Id,
        Name,
        BaseCost,
        EstimatedDays,
        IsActive,
    }

    #[derive(DeriveIden)]
    enum TaxRates {
        Table,
        Id,
        Country,
        State,
        Rate,
        IsActive,
    }

    #[derive(DeriveIden)]
    enum Coupons {
        Table,
        Id,
        Code,
        DiscountType,
        DiscountValue,
        MinPurchaseAmount,
        MaxDiscountAmount,
        ValidFrom,
        ValidUntil,
        UsageLimit,
        UsedCount,
        IsActive,
    }
}

mod m20240301_000002_create_orders_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_orders_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::OrderNumber).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::ShippingMethodId).uuid().not_null())
                        .col(ColumnDef::new(Orders::ShippingAddress).text().not_null())
                        .col(ColumnDef::new(Orders::Subtotal).decimal_len(16, 4).not_null())
                        .col(
                            ColumnDef::new(Orders::DiscountAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TaxAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::ShippingCost)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalAmount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::CouponId).uuid().null())
                        .col(ColumnDef::new(Orders::CouponCode).string_len(64).null())
                        .col(ColumnDef::new(Orders::Status).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Orders::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
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
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_order_number")
                        .table(Orders::Table)
                        .col(Orders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::MedicineId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::LineTotal)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderStatusHistory::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderStatusHistory::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderStatusHistory::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderStatusHistory::FromStatus)
                                .string_len(32)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderStatusHistory::ToStatus)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderStatusHistory::Reason).string().null())
                        .col(
                            ColumnDef::new(OrderStatusHistory::CreatedAt)
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
                        .name("idx_order_status_history_order_id")
                        .table(OrderStatusHistory::Table)
                        .col(OrderStatusHistory::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderStatusHistory::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        OrderNumber,
        UserId,
        ShippingMethodId,
        ShippingAddress,
        Subtotal,
        DiscountAmount,
        TaxAmount,
        ShippingCost,
        TotalAmount,
        Currency,
        CouponId,
        CouponCode,
        Status,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        MedicineId,
        Quantity,
        UnitPrice,
        LineTotal,
    }

    #[derive(DeriveIden)]
    enum OrderStatusHistory {
        Table,
        Id,
        OrderId,
        FromStatus,
        ToStatus,
        Reason,
        CreatedAt,
    }
}

mod m20240301_000003_create_payments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_payments_table"
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
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::Method).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::ExternalReference).string().null())
                        .col(ColumnDef::new(Payments::ReferenceNumber).string().null())
                        .col(ColumnDef::new(Payments::ProofUrl).string().null())
                        .col(ColumnDef::new(Payments::CheckoutUrl).string().null())
                        .col(ColumnDef::new(Payments::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::FailureReason).string().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::PaidAt)
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
                .await?;

            // NULLs are distinct, so manual-proof payments without a reference coexist
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_external_reference")
                        .table(Payments::Table)
                        .col(Payments::ExternalReference)
                        .unique()
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
        Currency,
        Method,
        ExternalReference,
        ReferenceNumber,
        ProofUrl,
        CheckoutUrl,
        Status,
        FailureReason,
        CreatedAt,
        UpdatedAt,
        PaidAt,
    }
}

mod m20240301_000004_create_inventory_ledger_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_inventory_ledger_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InventoryLedger::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryLedger::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryLedger::OrderId).uuid().not_null())
                        .col(ColumnDef::new(InventoryLedger::MedicineId).uuid().not_null())
                        .col(ColumnDef::new(InventoryLedger::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(InventoryLedger::Direction)
                                .string_len(10)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryLedger::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One reserve and at most one release per order line
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_ledger_order_medicine_direction")
                        .table(InventoryLedger::Table)
                        .col(InventoryLedger::OrderId)
                        .col(InventoryLedger::MedicineId)
                        .col(InventoryLedger::Direction)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryLedger::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum InventoryLedger {
        Table,
        Id,
        OrderId,
        MedicineId,
        Quantity,
        Direction,
        CreatedAt,
    }
}

mod m20240301_000005_create_cart_and_tracking_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_cart_and_tracking_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CartItems::UserId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::MedicineId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
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
                        .name("idx_cart_items_user_id")
                        .table(CartItems::Table)
                        .col(CartItems::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ShipmentTracking::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShipmentTracking::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ShipmentTracking::OrderId).uuid().not_null())
                        .col(ColumnDef::new(ShipmentTracking::Status).string_len(32).not_null())
                        .col(ColumnDef::new(ShipmentTracking::Description).string().not_null())
                        .col(
                            ColumnDef::new(ShipmentTracking::CreatedAt)
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
                        .name("idx_shipment_tracking_order_id")
                        .table(ShipmentTracking::Table)
                        .col(ShipmentTracking::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ShipmentTracking::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        UserId,
        MedicineId,
        Quantity,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ShipmentTracking {
        Table,
        Id,
        OrderId,
        Status,
        Description,
        CreatedAt,
    }
}

mod m20240301_000006_create_reconciliation_issues_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_reconciliation_issues_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ReconciliationIssues::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ReconciliationIssues::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ReconciliationIssues::PaymentId).uuid().null())
                        .col(ColumnDef::new(ReconciliationIssues::OrderId).uuid().null())
                        .col(
                            ColumnDef::new(ReconciliationIssues::ExternalReference)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ReconciliationIssues::Kind)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(ReconciliationIssues::Detail).text().not_null())
                        .col(ColumnDef::new(ReconciliationIssues::Payload).text().null())
                        .col(
                            ColumnDef::new(ReconciliationIssues::Resolved)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(ReconciliationIssues::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ReconciliationIssues::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ReconciliationIssues {
        Table,
        Id,
        PaymentId,
        OrderId,
        ExternalReference,
        Kind,
        Detail,
        Payload,
        Resolved,
        CreatedAt,
    }
}
