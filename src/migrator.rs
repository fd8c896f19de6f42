use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_purchase_request_tables::Migration),
            Box::new(m20240301_000002_create_purchase_order_tables::Migration),
            Box::new(m20240301_000003_create_inventory_and_return_tables::Migration),
            Box::new(m20240301_000004_create_receipt_and_invoice_tables::Migration),
        ]
    }
}

mod m20240301_000001_create_purchase_request_tables {
    use crate::entities::{purchase_request, purchase_request_item};
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_purchase_request_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(
                    schema
                        .create_table_from_entity(purchase_request::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(purchase_request_item::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_purchase_requests_parent")
                        .table(purchase_request::Entity)
                        .col(purchase_request::Column::ParentRequestId)
                        .to_owned(),
                )
                .await?;
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_purchase_request_items_request")
                        .table(purchase_request_item::Entity)
                        .col(purchase_request_item::Column::PurchaseRequestId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(purchase_request_item::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(purchase_request::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000002_create_purchase_order_tables {
    use crate::entities::{purchase_order, request_po_link};
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_purchase_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(
                    schema
                        .create_table_from_entity(purchase_order::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(request_po_link::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_request_po_links_order")
                        .table(request_po_link::Entity)
                        .col(request_po_link::Column::PurchaseOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(request_po_link::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(purchase_order::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000003_create_inventory_and_return_tables {
    use crate::entities::{inventory_record, return_request};
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_inventory_and_return_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(
                    schema
                        .create_table_from_entity(inventory_record::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            // One ledger record per (supplier, product)
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("idx_inventory_records_supplier_product")
                        .table(inventory_record::Entity)
                        .col(inventory_record::Column::SupplierId)
                        .col(inventory_record::Column::ProductId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    schema
                        .create_table_from_entity(return_request::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(return_request::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(inventory_record::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000004_create_receipt_and_invoice_tables {
    use crate::entities::{goods_receipt, goods_receipt_line, invoice, invoice_line};
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_receipt_and_invoice_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            // Unique columns on goods_receipts.purchase_order_id and invoices.goods_receipt_id
            // back the one-per-parent rules under concurrent callers.
            manager
                .create_table(
                    schema
                        .create_table_from_entity(goods_receipt::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(goods_receipt_line::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(invoice::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(invoice_line::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(invoice_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(invoice::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_receipt_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_receipt::Entity).to_owned())
                .await
        }
    }
}
