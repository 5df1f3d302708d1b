use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Apps::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Apps::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Apps::AccountId).uuid())
                    .col(ColumnDef::new(Apps::Name).string().not_null())
                    .col(ColumnDef::new(Apps::Active).boolean().not_null().default(true))
                    .col(ColumnDef::new(Apps::Sandbox).boolean().not_null().default(false))
                    .col(ColumnDef::new(Apps::WebhookUrl).string())
                    .col(ColumnDef::new(Apps::WebhookSecretEnc).string())
                    .col(ColumnDef::new(Apps::DailyQuota).big_integer())
                    .col(ColumnDef::new(Apps::MonthlyQuota).big_integer())
                    .col(ColumnDef::new(Apps::Settings).json_binary().not_null())
                    .col(ColumnDef::new(Apps::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Apps::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Apps::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Apps {
    Table,
    Id,
    AccountId,
    Name,
    Active,
    Sandbox,
    WebhookUrl,
    WebhookSecretEnc,
    DailyQuota,
    MonthlyQuota,
    Settings,
    CreatedAt,
    UpdatedAt,
}
