use sea_orm_migration::prelude::*;

mod m20250301_000001_create_apps_table;
mod m20250301_000002_create_api_keys_table;
mod m20250301_000003_create_smtp_configs_table;
mod m20250301_000004_create_queues_table;
mod m20250301_000005_create_emails_table;
mod m20250301_000006_create_email_events_table;
mod m20250301_000007_create_suppressions_table;
mod m20250302_000001_create_jobs_table;
mod m20250302_000002_create_webhook_deliveries_table;
mod m20250302_000003_create_scheduled_emails_table;
mod m20250302_000004_create_tracking_links_table;
mod m20250302_000005_create_reputations_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_apps_table::Migration),
            Box::new(m20250301_000002_create_api_keys_table::Migration),
            Box::new(m20250301_000003_create_smtp_configs_table::Migration),
            Box::new(m20250301_000004_create_queues_table::Migration),
            Box::new(m20250301_000005_create_emails_table::Migration),
            Box::new(m20250301_000006_create_email_events_table::Migration),
            Box::new(m20250301_000007_create_suppressions_table::Migration),
            Box::new(m20250302_000001_create_jobs_table::Migration),
            Box::new(m20250302_000002_create_webhook_deliveries_table::Migration),
            Box::new(m20250302_000003_create_scheduled_emails_table::Migration),
            Box::new(m20250302_000004_create_tracking_links_table::Migration),
            Box::new(m20250302_000005_create_reputations_table::Migration),
        ]
    }
}
