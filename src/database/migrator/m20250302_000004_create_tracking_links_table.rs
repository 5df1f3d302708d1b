use sea_orm_migration::prelude::*;

use super::m20250301_000005_create_emails_table::Emails;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrackingLinks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TrackingLinks::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TrackingLinks::EmailId).uuid().not_null())
                    .col(ColumnDef::new(TrackingLinks::ShortCode).string().not_null())
                    .col(ColumnDef::new(TrackingLinks::OriginalUrl).text().not_null())
                    .col(
                        ColumnDef::new(TrackingLinks::ClickCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackingLinks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-tracking_links-email_id")
                            .from(TrackingLinks::Table, TrackingLinks::EmailId)
                            .to(Emails::Table, Emails::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tracking_links_short_code")
                    .table(TrackingLinks::Table)
                    .col(TrackingLinks::ShortCode)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tracking_links_email_id")
                    .table(TrackingLinks::Table)
                    .col(TrackingLinks::EmailId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrackingLinks::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum TrackingLinks {
    Table,
    Id,
    EmailId,
    ShortCode,
    OriginalUrl,
    ClickCount,
    CreatedAt,
}
