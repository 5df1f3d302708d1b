use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_apps_table::Apps;
use super::m20250301_000005_create_emails_table::Emails;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookDeliveries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookDeliveries::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookDeliveries::AppId).uuid().not_null())
                    .col(ColumnDef::new(WebhookDeliveries::EmailId).uuid())
                    .col(ColumnDef::new(WebhookDeliveries::EventType).string().not_null())
                    .col(ColumnDef::new(WebhookDeliveries::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(WebhookDeliveries::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(WebhookDeliveries::Attempts).integer().not_null().default(0))
                    .col(ColumnDef::new(WebhookDeliveries::LastError).text())
                    .col(ColumnDef::new(WebhookDeliveries::NextRetryAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(WebhookDeliveries::DeliveredAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(WebhookDeliveries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookDeliveries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-webhook_deliveries-app_id")
                            .from(WebhookDeliveries::Table, WebhookDeliveries::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-webhook_deliveries-email_id")
                            .from(WebhookDeliveries::Table, WebhookDeliveries::EmailId)
                            .to(Emails::Table, Emails::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Sweeper scan for due retries
        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_deliveries_status_next_retry")
                    .table(WebhookDeliveries::Table)
                    .col(WebhookDeliveries::Status)
                    .col(WebhookDeliveries::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_deliveries_app_created")
                    .table(WebhookDeliveries::Table)
                    .col(WebhookDeliveries::AppId)
                    .col((WebhookDeliveries::CreatedAt, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WebhookDeliveries::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum WebhookDeliveries {
    Table,
    Id,
    AppId,
    EmailId,
    EventType,
    Payload,
    Status,
    Attempts,
    LastError,
    NextRetryAt,
    DeliveredAt,
    CreatedAt,
    UpdatedAt,
}
