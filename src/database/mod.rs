pub mod api_keys;
pub mod apps;
pub mod email_events;
pub mod emails;
pub mod jobs;
pub mod migrator;
pub mod queues;
pub mod reputations;
pub mod scheduled_emails;
pub mod smtp_configs;
pub mod suppressions;
pub mod tracking_links;
pub mod webhook_deliveries;

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;

/// Connects and brings the schema up to date. All tables are managed by the
/// migrator in `database::migrator`.
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;
    migrator::Migrator::up(&db, None).await?;
    Ok(db)
}
