use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use printshop_authz::db::row_parsers::{permission_from_row, role_from_row};

// One connection: every in-memory connection is its own database.
async fn setup_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect")
}

#[tokio::test]
async fn parse_role_row_with_sqlite_timestamps() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TABLE roles (id INTEGER PRIMARY KEY, name TEXT, description TEXT, is_superuser INTEGER, grant_revision INTEGER, created_at TEXT, updated_at TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();

    // Hand-seeded rows use CURRENT_TIMESTAMP rather than RFC3339.
    sqlx::query("INSERT INTO roles VALUES (7, 'Technician', NULL, 0, 3, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)")
        .execute(&pool)
        .await
        .unwrap();

    let row = sqlx::query("SELECT * FROM roles WHERE id = 7").fetch_one(&pool).await.unwrap();
    let role = role_from_row(&row).unwrap();

    assert_eq!(role.id, 7);
    assert_eq!(role.name, "Technician");
    assert_eq!(role.description, None);
    assert!(!role.is_superuser);
    assert_eq!(role.grant_revision, 3);
}

#[tokio::test]
async fn parse_permission_row_rfc3339() {
    let pool = setup_pool().await;
    sqlx::query("CREATE TABLE permissions (id INTEGER PRIMARY KEY, code TEXT, description TEXT, created_at TEXT, updated_at TEXT)")
        .execute(&pool)
        .await
        .unwrap();

    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query("INSERT INTO permissions VALUES (1, 'po.approve', 'Approve purchase orders', ?, ?)")
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();

    let row = sqlx::query("SELECT * FROM permissions").fetch_one(&pool).await.unwrap();
    let permission = permission_from_row(&row).unwrap();

    assert_eq!(permission.code, "po.approve");
    assert_eq!(permission.description.as_deref(), Some("Approve purchase orders"));
    assert_eq!(permission.created_at.to_rfc3339(), now);
}
