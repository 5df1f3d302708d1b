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
                    .table(Reputations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Reputations::AppId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Reputations::Score).double().not_null().default(100.0))
                    .col(ColumnDef::new(Reputations::SentCount).big_integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Reputations::BounceCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Reputations::ComplaintCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Reputations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-reputations-app_id")
                            .from(Reputations::Table, Reputations::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Reputations::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Reputations {
    Table,
    AppId,
    Score,
    SentCount,
    BounceCount,
    ComplaintCount,
    UpdatedAt,
}
