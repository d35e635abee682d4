//! Minimal persisted state for the agent: a SQLite-backed table described by
//! an explicit descriptor instead of an ORM. Each entity lists its columns
//! once; a single routine creates the table and the free functions build
//! their SQL from the same descriptor.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: &'static str,
    /// Extra column constraints, e.g. `PRIMARY KEY AUTOINCREMENT` or `NOT NULL UNIQUE`.
    pub constraints: &'static str,
    /// Generated columns are skipped on insert.
    pub generated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
}

impl TableSpec {
    fn create_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| {
                if c.constraints.is_empty() {
                    format!("{} {}", c.name, c.sql_type)
                } else {
                    format!("{} {} {}", c.name, c.sql_type, c.constraints)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, cols)
    }
}

/// Narrow mapping between one Rust struct and one table row.
pub trait Record: Sized {
    fn table() -> &'static TableSpec;
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self>;
    /// Column/value pairs for insertion; generated columns are omitted.
    fn to_values(&self) -> Vec<(&'static str, String)>;
}

pub async fn open(url: &str) -> anyhow::Result<SqlitePool> {
    // An in-memory database exists per connection; cap the pool at one so
    // every query sees the same tables.
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

pub async fn ensure_table(pool: &SqlitePool, spec: &TableSpec) -> anyhow::Result<()> {
    sqlx::query(&spec.create_sql()).execute(pool).await?;
    Ok(())
}

pub async fn get_all<R: Record>(pool: &SqlitePool) -> anyhow::Result<Vec<R>> {
    let sql = format!("SELECT * FROM {}", R::table().name);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(R::from_row(row)?);
    }
    Ok(out)
}

pub async fn find_by<R: Record>(
    pool: &SqlitePool,
    column: &str,
    value: &str,
) -> anyhow::Result<Option<R>> {
    let sql = format!("SELECT * FROM {} WHERE {} = ?", R::table().name, column);
    let row = sqlx::query(&sql).bind(value).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(R::from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn insert<R: Record>(pool: &SqlitePool, record: &R) -> anyhow::Result<()> {
    let values = record.to_values();
    let cols = values
        .iter()
        .map(|(c, _)| *c)
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        R::table().name,
        cols,
        placeholders
    );
    let mut q = sqlx::query(&sql);
    for (_, v) in &values {
        q = q.bind(v.clone());
    }
    q.execute(pool).await?;
    Ok(())
}

pub async fn delete_by(
    pool: &SqlitePool,
    spec: &TableSpec,
    column: &str,
    value: &str,
) -> anyhow::Result<u64> {
    let sql = format!("DELETE FROM {} WHERE {} = ?", spec.name, column);
    let res = sqlx::query(&sql).bind(value).execute(pool).await?;
    Ok(res.rows_affected())
}

/// One managed server id. The id column is only there to keep the rows
/// addressable; `server_id` is the value the agent cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: i64,
    pub server_id: String,
}

static SERVERS: TableSpec = TableSpec {
    name: "servers",
    columns: &[
        ColumnSpec {
            name: "id",
            sql_type: "INTEGER",
            constraints: "PRIMARY KEY AUTOINCREMENT",
            generated: true,
        },
        ColumnSpec {
            name: "server_id",
            sql_type: "TEXT",
            constraints: "NOT NULL UNIQUE",
            generated: false,
        },
    ],
};

impl Record for ServerRecord {
    fn table() -> &'static TableSpec {
        &SERVERS
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            server_id: row.try_get("server_id")?,
        })
    }

    fn to_values(&self) -> Vec<(&'static str, String)> {
        SERVERS
            .columns
            .iter()
            .filter(|c| !c.generated)
            .map(|c| match c.name {
                "server_id" => (c.name, self.server_id.clone()),
                other => unreachable!("unmapped column {other}"),
            })
            .collect()
    }
}

impl ServerRecord {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            server_id: server_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = open("sqlite::memory:").await.unwrap();
        ensure_table(&pool, ServerRecord::table()).await.unwrap();
        pool
    }

    #[test]
    fn create_sql_lists_all_columns() {
        let sql = SERVERS.create_sql();
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS servers"));
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("server_id TEXT NOT NULL UNIQUE"));
    }

    #[tokio::test]
    async fn insert_and_list_round_trip() {
        let pool = memory_pool().await;
        insert(&pool, &ServerRecord::new("s1")).await.unwrap();
        insert(&pool, &ServerRecord::new("s2")).await.unwrap();

        let all: Vec<ServerRecord> = get_all(&pool).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.server_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn find_and_delete_by_server_id() {
        let pool = memory_pool().await;
        insert(&pool, &ServerRecord::new("s1")).await.unwrap();

        let found: Option<ServerRecord> = find_by(&pool, "server_id", "s1").await.unwrap();
        assert_eq!(found.map(|r| r.server_id), Some("s1".to_string()));

        let removed = delete_by(&pool, ServerRecord::table(), "server_id", "s1")
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let gone: Option<ServerRecord> = find_by(&pool, "server_id", "s1").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn duplicate_server_id_is_rejected() {
        let pool = memory_pool().await;
        insert(&pool, &ServerRecord::new("s1")).await.unwrap();
        assert!(insert(&pool, &ServerRecord::new("s1")).await.is_err());
    }

    #[tokio::test]
    async fn delete_then_reinsert_succeeds() {
        let pool = memory_pool().await;
        insert(&pool, &ServerRecord::new("s1")).await.unwrap();
        delete_by(&pool, ServerRecord::table(), "server_id", "s1")
            .await
            .unwrap();
        insert(&pool, &ServerRecord::new("s1")).await.unwrap();
    }
}
