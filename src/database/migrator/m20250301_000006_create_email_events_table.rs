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
                    .table(EmailEvents::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(EmailEvents::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(EmailEvents::EmailId).uuid().not_null())
                    .col(ColumnDef::new(EmailEvents::EventType).string().not_null())
                    .col(ColumnDef::new(EmailEvents::EventData).json_binary().not_null())
                    .col(
                        ColumnDef::new(EmailEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-email_events-email_id")
                            .from(EmailEvents::Table, EmailEvents::EmailId)
                            .to(Emails::Table, Emails::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_events_email_created")
                    .table(EmailEvents::Table)
                    .col(EmailEvents::EmailId)
                    .col((EmailEvents::CreatedAt, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailEvents::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum EmailEvents {
    Table,
    Id,
    EmailId,
    EventType,
    EventData,
    CreatedAt,
}
