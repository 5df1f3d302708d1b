use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_apps_table::Apps;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SmtpConfigs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SmtpConfigs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SmtpConfigs::AppId).uuid().not_null())
                    .col(ColumnDef::new(SmtpConfigs::Name).string().not_null())
                    .col(ColumnDef::new(SmtpConfigs::Host).string().not_null())
                    .col(ColumnDef::new(SmtpConfigs::Port).integer().not_null())
                    .col(ColumnDef::new(SmtpConfigs::Username).string().not_null())
                    .col(ColumnDef::new(SmtpConfigs::PasswordEnc).string().not_null())
                    .col(
                        ColumnDef::new(SmtpConfigs::Encryption)
                            .string()
                            .not_null()
                            .default("tls"),
                    )
                    .col(ColumnDef::new(SmtpConfigs::PoolSize).small_integer().not_null().default(5))
                    .col(
                        ColumnDef::new(SmtpConfigs::TimeoutMs)
                            .integer()
                            .not_null()
                            .default(30000),
                    )
                    .col(ColumnDef::new(SmtpConfigs::Active).boolean().not_null().default(true))
                    .col(
                        ColumnDef::new(SmtpConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-smtp_configs-app_id")
                            .from(SmtpConfigs::Table, SmtpConfigs::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_smtp_configs_app_id")
                    .table(SmtpConfigs::Table)
                    .col(SmtpConfigs::AppId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SmtpConfigs::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum SmtpConfigs {
    Table,
    Id,
    AppId,
    Name,
    Host,
    Port,
    Username,
    PasswordEnc,
    Encryption,
    PoolSize,
    TimeoutMs,
    Active,
    CreatedAt,
}
