//! SQLite access for the analytics tool.
//!
//! The `execute_sql_query` tool only ever sees a read-only pool, so a
//! model-generated statement cannot modify the database even if it slips
//! past the SELECT check. [`create_demo_database`] seeds a small plant
//! database (production output, alarms, MES orders) matching the schema
//! the `db` prompt describes.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub const DEMO_DEVICES: [&str; 3] = ["Motor-01", "Motor-02", "Pump-01"];

/// Open a read-only pool. Connections are established on first use.
pub fn connect_read_only(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url: {database_url}"))?
        .read_only(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_lazy_with(options))
}

/// Create (or reset) a SQLite file with the demo plant schema and rows.
pub async fn create_demo_database(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    for statement in [
        "DROP TABLE IF EXISTS ProductionData",
        "DROP TABLE IF EXISTS DeviceAlarms",
        "DROP TABLE IF EXISTS MesOrders",
        r#"
        CREATE TABLE ProductionData (
            DeviceId TEXT NOT NULL,
            OutputQuantity INTEGER NOT NULL,
            DefectQuantity INTEGER NOT NULL,
            RecordTime TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE DeviceAlarms (
            DeviceId TEXT NOT NULL,
            AlarmCode TEXT NOT NULL,
            DurationMinutes INTEGER NOT NULL,
            AlarmTime TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE MesOrders (
            OrderNo TEXT PRIMARY KEY,
            ProductCode TEXT NOT NULL,
            TargetQuantity INTEGER NOT NULL,
            CompletedQuantity INTEGER NOT NULL,
            OrderStatus TEXT NOT NULL,
            PlanStartTime TEXT NOT NULL,
            ActualEndTime TEXT
        )
        "#,
    ] {
        sqlx::query(statement).execute(&pool).await?;
    }

    let mut tx = pool.begin().await?;
    for day in 1..=7i64 {
        for (n, device) in DEMO_DEVICES.iter().enumerate() {
            let n = n as i64;
            let output = 800 + day * 37 + n * 120 - (day % 3) * 45;
            let defects = 3 + (day * (n + 2)) % 11;
            sqlx::query(
                "INSERT INTO ProductionData (DeviceId, OutputQuantity, DefectQuantity, RecordTime) VALUES (?, ?, ?, ?)",
            )
            .bind(*device)
            .bind(output)
            .bind(defects)
            .bind(format!("2026-03-{day:02} 20:00:00"))
            .execute(&mut *tx)
            .await?;
        }
    }

    let alarms = [
        ("Motor-01", "E-101", 12, "2026-03-02 09:14:00"),
        ("Motor-02", "E-204", 35, "2026-03-03 14:40:00"),
        ("Pump-01", "P-310", 8, "2026-03-03 22:05:00"),
        ("Motor-01", "E-101", 20, "2026-03-05 11:30:00"),
        ("Pump-01", "P-312", 55, "2026-03-06 03:12:00"),
    ];
    for (device, code, minutes, at) in alarms {
        sqlx::query(
            "INSERT INTO DeviceAlarms (DeviceId, AlarmCode, DurationMinutes, AlarmTime) VALUES (?, ?, ?, ?)",
        )
        .bind(device)
        .bind(code)
        .bind(minutes)
        .bind(at)
        .execute(&mut *tx)
        .await?;
    }

    let orders = [
        ("MO-2026-001", "GB-450", 5000, 5000, "Completed", "2026-03-01 08:00:00", Some("2026-03-04 17:20:00")),
        ("MO-2026-002", "GB-450", 3000, 1840, "InProgress", "2026-03-04 08:00:00", None),
        ("MO-2026-003", "PV-120", 1200, 0, "Planned", "2026-03-09 08:00:00", None),
    ];
    for (order_no, product, target, completed, status, start, end) in orders {
        sqlx::query(
            "INSERT INTO MesOrders (OrderNo, ProductCode, TargetQuantity, CompletedQuantity, OrderStatus, PlanStartTime, ActualEndTime) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order_no)
        .bind(product)
        .bind(target)
        .bind(completed)
        .bind(status)
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    pool.close().await;

    tracing::info!(path = %path.display(), "demo database created");
    Ok(())
}

/// `sqlite://` URL for a database file.
pub fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}", path.display())
}
