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
                    .table(Suppressions::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Suppressions::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Suppressions::AppId).uuid())
                    .col(ColumnDef::new(Suppressions::Email).string().not_null())
                    .col(ColumnDef::new(Suppressions::Reason).string().not_null())
                    .col(ColumnDef::new(Suppressions::SourceEmailId).uuid())
                    .col(ColumnDef::new(Suppressions::ExpiresAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Suppressions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-suppressions-app_id")
                            .from(Suppressions::Table, Suppressions::AppId)
                            .to(Apps::Table, Apps::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-suppressions-source_email_id")
                            .from(Suppressions::Table, Suppressions::SourceEmailId)
                            .to(Emails::Table, Emails::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Covers both tenant-scoped and global (app_id NULL) entries; postgres
        // treats NULLs as distinct so global uniqueness is enforced in code.
        manager
            .create_index(
                Index::create()
                    .name("idx_suppressions_app_id_email")
                    .table(Suppressions::Table)
                    .col(Suppressions::AppId)
                    .col(Suppressions::Email)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_suppressions_email")
                    .table(Suppressions::Table)
                    .col(Suppressions::Email)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Suppressions::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Suppressions {
    Table,
    Id,
    AppId,
    Email,
    Reason,
    SourceEmailId,
    ExpiresAt,
    CreatedAt,
}
