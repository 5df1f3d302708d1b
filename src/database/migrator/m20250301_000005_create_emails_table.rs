use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_apps_table::Apps;
use super::m20250301_000004_create_queues_table::Queues;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Emails::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Emails::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Emails::AppId).uuid().not_null())
                    .col(ColumnDef::new(Emails::QueueId).uuid().not_null())
                    .col(ColumnDef::new(Emails::IdempotencyKey).string())
                    .col(ColumnDef::new(Emails::MessageId).string())
                    .col(ColumnDef::new(Emails::FromEmail).string().not_null())
                    .col(ColumnDef::new(Emails::FromName).string())
                    .col(ColumnDef::new(Emails::To).json_binary().not_null())
                    .col(ColumnDef::new(Emails::Cc).json_binary().not_null())
                    .col(ColumnDef::new(Emails::Bcc).json_binary().not_null())
                    .col(ColumnDef::new(Emails::ReplyTo).string())
                    .col(ColumnDef::new(Emails::Subject).string().not_null())
                    .col(ColumnDef::new(Emails::HtmlBody).text())
                    .col(ColumnDef::new(Emails::TextBody).text())
                    .col(ColumnDef::new(Emails::Headers).json_binary().not_null())
                    .col(ColumnDef::new(Emails::Personalization).json_binary().not_null())
                    .col(ColumnDef::new(Emails::Metadata).json_binary().not_null())
                    .col(ColumnDef::new(Emails::Status).string().not_null().default("queued"))
                    .col(ColumnDef::new(Emails::RetryCount).integer().not_null().default(0))
                    .col(ColumnDef::new(Emails::LastError).text())
                    .col(ColumnDef::new(Emails::ScheduledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Emails::SentAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Emails::DeliveredAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Emails::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Emails::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-emails-app_id")
                            .from(Emails::Table, Emails::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-emails-queue_id")
                            .from(Emails::Table, Emails::QueueId)
                            .to(Queues::Table, Queues::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Idempotent resubmission within an app
        manager
            .create_index(
                Index::create()
                    .name("idx_emails_app_id_idempotency_key")
                    .table(Emails::Table)
                    .col(Emails::AppId)
                    .col(Emails::IdempotencyKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Keyset listings: (created_at desc, id desc)
        manager
            .create_index(
                Index::create()
                    .name("idx_emails_app_created_id")
                    .table(Emails::Table)
                    .col(Emails::AppId)
                    .col((Emails::CreatedAt, IndexOrder::Desc))
                    .col((Emails::Id, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_emails_status")
                    .table(Emails::Table)
                    .col(Emails::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Emails::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Emails {
    Table,
    Id,
    AppId,
    QueueId,
    IdempotencyKey,
    MessageId,
    FromEmail,
    FromName,
    To,
    Cc,
    Bcc,
    ReplyTo,
    Subject,
    HtmlBody,
    TextBody,
    Headers,
    Personalization,
    Metadata,
    Status,
    RetryCount,
    LastError,
    ScheduledAt,
    SentAt,
    DeliveredAt,
    CreatedAt,
    UpdatedAt,
}
