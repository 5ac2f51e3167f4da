use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use log::info;
use uuid::Uuid;

use crate::shared::config::DatabaseConfig;
use crate::shared::models::schema::queue_services;
use crate::shared::models::QueueService;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(cfg: &DatabaseConfig) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(&cfg.url);
    Pool::builder()
        .max_size(cfg.max_connections)
        .build(manager)
        .with_context(|| format!("Failed to create database pool for {}", cfg.url))
}

/// Run database migrations
pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS).map_err(
        |e| -> Box<dyn std::error::Error + Send + Sync> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Migration error: {}", e),
            ))
        },
    )?;
    Ok(())
}

/// Seed one service on a fresh install so the kiosk can issue tickets
/// before any admin configuration happens.
pub fn seed_default_service(pool: &DbPool) -> Result<()> {
    let mut conn = pool.get()?;

    let existing: i64 = queue_services::table.count().get_result(&mut conn)?;
    if existing > 0 {
        return Ok(());
    }

    let now = Utc::now();
    let service = QueueService {
        id: Uuid::new_v4(),
        name: "General attention".to_string(),
        prefix: "A".to_string(),
        priority_level: 1,
        estimated_minutes: 10,
        is_active: true,
        created_at: now,
        updated_at: now,
    };

    diesel::insert_into(queue_services::table)
        .values(&service)
        .execute(&mut conn)?;

    info!("Seeded default service {} ({})", service.name, service.id);
    Ok(())
}
