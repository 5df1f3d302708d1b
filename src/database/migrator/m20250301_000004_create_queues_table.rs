use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_apps_table::Apps;
use super::m20250301_000003_create_smtp_configs_table::SmtpConfigs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Queues::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Queues::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Queues::AppId).uuid().not_null())
                    .col(ColumnDef::new(Queues::Name).string().not_null())
                    .col(ColumnDef::new(Queues::Priority).small_integer().not_null().default(5))
                    .col(ColumnDef::new(Queues::RateLimit).integer())
                    .col(ColumnDef::new(Queues::MaxRetries).small_integer().not_null().default(3))
                    .col(ColumnDef::new(Queues::RetryDelays).json_binary().not_null())
                    .col(ColumnDef::new(Queues::SmtpConfigId).uuid())
                    .col(ColumnDef::new(Queues::Paused).boolean().not_null().default(false))
                    .col(ColumnDef::new(Queues::TrackOpens).boolean().not_null().default(false))
                    .col(ColumnDef::new(Queues::TrackClicks).boolean().not_null().default(false))
                    .col(ColumnDef::new(Queues::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Queues::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-queues-app_id")
                            .from(Queues::Table, Queues::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-queues-smtp_config_id")
                            .from(Queues::Table, Queues::SmtpConfigId)
                            .to(SmtpConfigs::Table, SmtpConfigs::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Queue names resolve per app at admission time
        manager
            .create_index(
                Index::create()
                    .name("idx_queues_app_id_name")
                    .table(Queues::Table)
                    .col(Queues::AppId)
                    .col(Queues::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Queues::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Queues {
    Table,
    Id,
    AppId,
    Name,
    Priority,
    RateLimit,
    MaxRetries,
    RetryDelays,
    SmtpConfigId,
    Paused,
    TrackOpens,
    TrackClicks,
    CreatedAt,
    UpdatedAt,
}
