//! SQLite storage. One table per kind for entities, their price history and
//! their subscriber edges; names come from the kind's [`KindSpec`].

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::EntityRepository;
use crate::entity::{Entity, EntityDetails, EntityKey, EntityKind, KindSpec, PricePoint, User};
use crate::error::{Result, TrackerError};

pub struct SqliteRepository {
    pool: SqlitePool,
    /// Serializes read-check-write sequences (subscribe with a cap, price updates).
    write: Mutex<()>,
}

impl SqliteRepository {
    /// Opens (creating if missing) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database; keep exactly one alive.
        let mut pool = SqlitePoolOptions::new();
        if url.contains(":memory:") || url.contains("mode=memory") {
            pool = pool
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool.connect_with(options).await?;

        let repo = Self {
            pool,
            write: Mutex::new(()),
        };
        repo.migrate().await?;
        tracing::info!(url, "database ready");
        Ok(repo)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id    INTEGER PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name  TEXT,
                username   TEXT,
                lang_code  TEXT NOT NULL DEFAULT 'de-DE'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for kind in EntityKind::ALL {
            for ddl in kind_schema(kind.spec()) {
                sqlx::query(&ddl).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

fn kind_schema(s: &KindSpec) -> [String; 4] {
    let (table, id, prices, subs) = (s.table, s.id_column, s.prices_table, s.subscribers_table);
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {id}  INTEGER PRIMARY KEY,
                name  TEXT NOT NULL,
                price TEXT NOT NULL,
                url   TEXT NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {prices} (
                {id}      INTEGER NOT NULL REFERENCES {table}({id}) ON DELETE CASCADE,
                price     TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS {prices}_by_time ON {prices} ({id}, timestamp)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {subs} (
                {id}    INTEGER NOT NULL REFERENCES {table}({id}) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                PRIMARY KEY ({id}, user_id)
            )"
        ),
    ]
}

// SQLite integers are signed; ids round-trip through a bit cast.
fn to_db(id: u64) -> i64 {
    id as i64
}

fn from_db(id: i64) -> u64 {
    id as u64
}

fn decode_price(raw: &str) -> sqlx::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn entity_columns(s: &KindSpec) -> String {
    format!("e.{} AS id, e.name, e.price, e.url", s.id_column)
}

fn entity_from_row(kind: EntityKind, row: &SqliteRow) -> sqlx::Result<Entity> {
    let price: String = row.try_get("price")?;
    Ok(Entity::new(
        kind,
        EntityDetails {
            id: from_db(row.try_get("id")?),
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            price: decode_price(&price)?,
        },
    ))
}

fn user_from_row(row: &SqliteRow) -> sqlx::Result<User> {
    Ok(User {
        user_id: from_db(row.try_get("user_id")?),
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        username: row.try_get("username")?,
        lang_code: row.try_get("lang_code")?,
    })
}

#[async_trait]
impl EntityRepository for SqliteRepository {
    async fn add_user_if_absent(&self, user: &User) -> Result<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO users (user_id, first_name, last_name, username, lang_code)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(to_db(user.user_id))
        .bind(user.first_name.as_str())
        .bind(user.last_name.as_deref())
        .bind(user.username.as_deref())
        .bind(user.lang_code.as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn get_user(&self, user_id: u64) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT user_id, first_name, last_name, username, lang_code FROM users WHERE user_id = ?",
        )
        .bind(to_db(user_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn delete_user(&self, user_id: u64) -> Result<()> {
        // Subscriber rows follow through ON DELETE CASCADE.
        sqlx::query("DELETE FROM users WHERE user_id = ?")
            .bind(to_db(user_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_entity_if_absent(&self, entity: &Entity) -> Result<bool> {
        let s = entity.kind().spec();
        let _guard = self.write.lock().await;
        let mut tx = self.pool.begin().await?;

        let done = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} ({}, name, price, url) VALUES (?, ?, ?, ?)",
            s.table, s.id_column
        ))
        .bind(to_db(entity.id()))
        .bind(entity.name())
        .bind(entity.price().to_string())
        .bind(entity.url())
        .execute(&mut *tx)
        .await?;

        if done.rows_affected() == 0 {
            return Ok(false);
        }
        insert_price_point(&mut tx, entity.key(), entity.price()).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_entity(&self, key: EntityKey) -> Result<Option<Entity>> {
        let s = key.kind.spec();
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} e WHERE e.{} = ?",
            entity_columns(s),
            s.table,
            s.id_column
        ))
        .bind(to_db(key.id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| entity_from_row(key.kind, &r)).transpose()?)
    }

    async fn entities_with_subscribers(&self) -> Result<Vec<Entity>> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            let s = kind.spec();
            let rows = sqlx::query(&format!(
                "SELECT {cols} FROM {table} e
                 WHERE EXISTS (SELECT 1 FROM {subs} s WHERE s.{id} = e.{id})
                 ORDER BY e.{id}",
                cols = entity_columns(s),
                table = s.table,
                subs = s.subscribers_table,
                id = s.id_column,
            ))
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                out.push(entity_from_row(kind, row)?);
            }
        }
        Ok(out)
    }

    async fn entities_for_user(&self, user_id: u64, kind: EntityKind) -> Result<Vec<Entity>> {
        let s = kind.spec();
        let rows = sqlx::query(&format!(
            "SELECT {cols} FROM {table} e
             JOIN {subs} s ON s.{id} = e.{id}
             WHERE s.user_id = ?
             ORDER BY e.{id}",
            cols = entity_columns(s),
            table = s.table,
            subs = s.subscribers_table,
            id = s.id_column,
        ))
        .bind(to_db(user_id))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| entity_from_row(kind, r))
            .collect::<sqlx::Result<_>>()?)
    }

    async fn update_price(&self, key: EntityKey, price: Decimal) -> Result<()> {
        let s = key.kind.spec();
        let _guard = self.write.lock().await;
        let mut tx = self.pool.begin().await?;

        let done = sqlx::query(&format!(
            "UPDATE {} SET price = ? WHERE {} = ?",
            s.table, s.id_column
        ))
        .bind(price.to_string())
        .bind(to_db(key.id))
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(TrackerError::EntityNotFound);
        }

        insert_price_point(&mut tx, key, price).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_name(&self, key: EntityKey, name: &str) -> Result<()> {
        let s = key.kind.spec();
        let done = sqlx::query(&format!(
            "UPDATE {} SET name = ? WHERE {} = ?",
            s.table, s.id_column
        ))
        .bind(name)
        .bind(to_db(key.id))
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(TrackerError::EntityNotFound);
        }
        Ok(())
    }

    async fn remove_entity(&self, key: EntityKey) -> Result<()> {
        let s = key.kind.spec();
        sqlx::query(&format!("DELETE FROM {} WHERE {} = ?", s.table, s.id_column))
            .bind(to_db(key.id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, user_id: u64, key: EntityKey, cap: Option<usize>) -> Result<()> {
        let s = key.kind.spec();
        let _guard = self.write.lock().await;
        let mut tx = self.pool.begin().await?;

        let entity = sqlx::query(&format!("SELECT 1 FROM {} WHERE {} = ?", s.table, s.id_column))
            .bind(to_db(key.id))
            .fetch_optional(&mut *tx)
            .await?;
        if entity.is_none() {
            return Err(TrackerError::EntityNotFound);
        }

        let user = sqlx::query("SELECT 1 FROM users WHERE user_id = ?")
            .bind(to_db(user_id))
            .fetch_optional(&mut *tx)
            .await?;
        if user.is_none() {
            return Err(TrackerError::UserNotFound(user_id));
        }

        let existing = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE {} = ? AND user_id = ?",
            s.subscribers_table, s.id_column
        ))
        .bind(to_db(key.id))
        .bind(to_db(user_id))
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(TrackerError::AlreadySubscribed);
        }

        if let Some(limit) = cap {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*) AS n FROM {} WHERE user_id = ?",
                s.subscribers_table
            ))
            .bind(to_db(user_id))
            .fetch_one(&mut *tx)
            .await?;
            let held: i64 = row.try_get("n")?;
            if held as usize >= limit {
                return Err(TrackerError::LimitReached {
                    kind: key.kind,
                    limit,
                });
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {} ({}, user_id) VALUES (?, ?)",
            s.subscribers_table, s.id_column
        ))
        .bind(to_db(key.id))
        .bind(to_db(user_id))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn unsubscribe(&self, user_id: u64, key: EntityKey) -> Result<()> {
        let s = key.kind.spec();
        sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = ? AND user_id = ?",
            s.subscribers_table, s.id_column
        ))
        .bind(to_db(key.id))
        .bind(to_db(user_id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_subscribed(&self, user_id: u64, key: EntityKey) -> Result<bool> {
        let s = key.kind.spec();
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE {} = ? AND user_id = ?",
            s.subscribers_table, s.id_column
        ))
        .bind(to_db(key.id))
        .bind(to_db(user_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn subscribers(&self, key: EntityKey) -> Result<Vec<u64>> {
        let s = key.kind.spec();
        let rows = sqlx::query(&format!(
            "SELECT user_id FROM {} WHERE {} = ? ORDER BY user_id",
            s.subscribers_table, s.id_column
        ))
        .bind(to_db(key.id))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<i64, _>("user_id").map(from_db))
            .collect::<sqlx::Result<_>>()?)
    }

    async fn subscription_count(&self, user_id: u64, kind: EntityKind) -> Result<usize> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {} WHERE user_id = ?",
            kind.spec().subscribers_table
        ))
        .bind(to_db(user_id))
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    async fn price_history(&self, key: EntityKey, since: OffsetDateTime) -> Result<Vec<PricePoint>> {
        let s = key.kind.spec();
        let rows = sqlx::query(&format!(
            "SELECT price, timestamp FROM {} WHERE {} = ? AND timestamp >= ?
             ORDER BY timestamp, rowid",
            s.prices_table, s.id_column
        ))
        .bind(to_db(key.id))
        .bind(since.unix_timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            let price: String = row.try_get("price")?;
            let ts: i64 = row.try_get("timestamp")?;
            points.push(PricePoint {
                key,
                price: decode_price(&price)?,
                timestamp: OffsetDateTime::from_unix_timestamp(ts)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            });
        }
        Ok(points)
    }
}

async fn insert_price_point(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: EntityKey,
    price: Decimal,
) -> Result<()> {
    let s = key.kind.spec();
    sqlx::query(&format!(
        "INSERT INTO {} ({}, price, timestamp) VALUES (?, ?, ?)",
        s.prices_table, s.id_column
    ))
    .bind(to_db(key.id))
    .bind(price.to_string())
    .bind(OffsetDateTime::now_utc().unix_timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
