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
                    .table(ScheduledEmails::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScheduledEmails::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScheduledEmails::AppId).uuid().not_null())
                    .col(ColumnDef::new(ScheduledEmails::QueueId).uuid().not_null())
                    .col(ColumnDef::new(ScheduledEmails::Name).string())
                    .col(ColumnDef::new(ScheduledEmails::CronExpression).string().not_null())
                    .col(
                        ColumnDef::new(ScheduledEmails::Timezone)
                            .string()
                            .not_null()
                            .default("UTC"),
                    )
                    .col(ColumnDef::new(ScheduledEmails::Template).json_binary().not_null())
                    .col(ColumnDef::new(ScheduledEmails::Active).boolean().not_null().default(true))
                    .col(ColumnDef::new(ScheduledEmails::LastRunAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(ScheduledEmails::NextRunAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(ScheduledEmails::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledEmails::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-scheduled_emails-app_id")
                            .from(ScheduledEmails::Table, ScheduledEmails::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-scheduled_emails-queue_id")
                            .from(ScheduledEmails::Table, ScheduledEmails::QueueId)
                            .to(Queues::Table, Queues::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_emails_active_next_run")
                    .table(ScheduledEmails::Table)
                    .col(ScheduledEmails::Active)
                    .col(ScheduledEmails::NextRunAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ScheduledEmails::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum ScheduledEmails {
    Table,
    Id,
    AppId,
    QueueId,
    Name,
    CronExpression,
    Timezone,
    Template,
    Active,
    LastRunAt,
    NextRunAt,
    CreatedAt,
    UpdatedAt,
}
