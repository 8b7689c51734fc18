//! PostgreSQL backend over `sqlx`, one `PgConnection` per pool slot.
//!
//! Rows live in a single table whose columns follow the tuple layout in
//! [`field`]. The `(is_deleted, key)` index serves the deleted-flag scans.

use async_trait::async_trait;
use rmpv::Value;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use super::{
    field, Assign, BackendConnection, BackendError, Connector, Guard, Select, Selector, Tuple,
    UpdateOutcome,
};

const COLUMNS: &str = "key, value, created_at, updated_at, deleted_at, is_deleted";

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS kv_records (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        deleted_at BIGINT NOT NULL DEFAULT 0,
        is_deleted BOOLEAN NOT NULL DEFAULT FALSE
    )
";

const CREATE_DELETED_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS kv_records_deleted_idx ON kv_records (is_deleted, key)";

/// Opens connections to one database URL.
#[derive(Debug, Clone)]
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Creates the records table and its index if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Connect`] if the database is unreachable, or
    /// the statement error otherwise.
    pub async fn migrate(&self) -> Result<(), BackendError> {
        let mut conn = self.connect().await?;
        sqlx::query(CREATE_TABLE)
            .execute(&mut conn.conn)
            .await
            .map_err(backend_error)?;
        sqlx::query(CREATE_DELETED_INDEX)
            .execute(&mut conn.conn)
            .await
            .map_err(backend_error)?;
        info!("kv_records schema ready");
        Ok(())
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgBackendConnection;

    async fn connect(&self) -> Result<PgBackendConnection, BackendError> {
        let conn = PgConnection::connect(&self.url)
            .await
            .map_err(|err| BackendError::Connect(err.to_string()))?;
        debug!("postgres connection opened");
        Ok(PgBackendConnection { conn })
    }
}

/// One PostgreSQL session.
#[derive(Debug)]
pub struct PgBackendConnection {
    conn: PgConnection,
}

fn backend_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Io(io) => BackendError::Io(io),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => BackendError::Closed,
        other => BackendError::Protocol(other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn window(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn tuple_from_row(row: &PgRow) -> Result<Tuple, BackendError> {
    Ok(vec![
        Value::from(row.try_get::<String, _>("key").map_err(backend_error)?),
        Value::from(row.try_get::<String, _>("value").map_err(backend_error)?),
        Value::from(row.try_get::<i64, _>("created_at").map_err(backend_error)?),
        Value::from(row.try_get::<i64, _>("updated_at").map_err(backend_error)?),
        Value::from(row.try_get::<i64, _>("deleted_at").map_err(backend_error)?),
        Value::Boolean(row.try_get::<bool, _>("is_deleted").map_err(backend_error)?),
    ])
}

/// A typed column value ready to bind.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Text(String),
    Int(i64),
    Bool(bool),
}

fn column(index: usize) -> Option<&'static str> {
    match index {
        field::KEY => Some("key"),
        field::VALUE => Some("value"),
        field::CREATED_AT => Some("created_at"),
        field::UPDATED_AT => Some("updated_at"),
        field::DELETED_AT => Some("deleted_at"),
        field::IS_DELETED => Some("is_deleted"),
        _ => None,
    }
}

fn param(index: usize, value: &Value) -> Result<Param, BackendError> {
    let param = match index {
        field::KEY | field::VALUE => value.as_str().map(|s| Param::Text(s.to_string())),
        field::CREATED_AT | field::UPDATED_AT | field::DELETED_AT => value.as_i64().map(Param::Int),
        field::IS_DELETED => value.as_bool().map(Param::Bool),
        _ => None,
    };
    param.ok_or_else(|| {
        BackendError::Protocol(format!("field {index} cannot hold {value}"))
    })
}

fn params_of(tuple: &Tuple) -> Result<Vec<Param>, BackendError> {
    if tuple.len() != field::COUNT {
        return Err(BackendError::Protocol(format!(
            "tuple has {} fields, expected {}",
            tuple.len(),
            field::COUNT
        )));
    }
    tuple
        .iter()
        .enumerate()
        .map(|(i, v)| param(i, v))
        .collect()
}

fn push_param(qb: &mut QueryBuilder<'_, Postgres>, param: Param) {
    match param {
        Param::Text(s) => qb.push_bind(s),
        Param::Int(n) => qb.push_bind(n),
        Param::Bool(b) => qb.push_bind(b),
    };
}

fn push_values(qb: &mut QueryBuilder<'_, Postgres>, params: Vec<Param>) {
    qb.push(" VALUES (");
    for (i, p) in params.into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_param(qb, p);
    }
    qb.push(")");
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, selector: &Selector) {
    match selector {
        Selector::Key(key) => {
            qb.push(" WHERE key = ").push_bind(key.clone());
        }
        Selector::All => {}
        Selector::Deleted(flag) => {
            qb.push(" WHERE is_deleted = ").push_bind(*flag);
        }
    }
}

#[async_trait]
impl BackendConnection for PgBackendConnection {
    async fn insert(&mut self, tuple: Tuple) -> Result<Tuple, BackendError> {
        let params = params_of(&tuple)?;
        let key = tuple[field::KEY].as_str().unwrap_or_default().to_string();

        let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO kv_records ({COLUMNS})"));
        push_values(&mut qb, params);
        qb.push(format!(" RETURNING {COLUMNS}"));

        match qb.build().fetch_one(&mut self.conn).await {
            Ok(row) => tuple_from_row(&row),
            Err(err) if is_unique_violation(&err) => Err(BackendError::Conflict { key }),
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn select(&mut self, query: &Select) -> Result<Vec<Tuple>, BackendError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM kv_records"));
        push_filter(&mut qb, &query.selector);
        qb.push(" ORDER BY key LIMIT ")
            .push_bind(window(query.limit))
            .push(" OFFSET ")
            .push_bind(window(query.offset));

        let rows = qb
            .build()
            .fetch_all(&mut self.conn)
            .await
            .map_err(backend_error)?;
        rows.iter().map(tuple_from_row).collect()
    }

    async fn count(&mut self, selector: &Selector) -> Result<u64, BackendError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM kv_records");
        push_filter(&mut qb, selector);

        let n: i64 = qb
            .build_query_scalar()
            .fetch_one(&mut self.conn)
            .await
            .map_err(backend_error)?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn update(
        &mut self,
        key: &str,
        ops: &[Assign],
        guard: Guard,
    ) -> Result<UpdateOutcome, BackendError> {
        if ops.is_empty() {
            return Err(BackendError::Protocol("update without assignments".to_string()));
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE kv_records SET ");
        for (i, op) in ops.iter().enumerate() {
            let name = match column(op.field) {
                Some(name) if op.field != field::KEY => name,
                _ => {
                    return Err(BackendError::Protocol(format!(
                        "field {} cannot be updated",
                        op.field
                    )))
                }
            };
            if i > 0 {
                qb.push(", ");
            }
            qb.push(name).push(" = ");
            push_param(&mut qb, param(op.field, &op.value)?);
        }
        qb.push(" WHERE key = ").push_bind(key.to_string());
        if let Guard::DeletedIs(flag) = guard {
            qb.push(" AND is_deleted = ").push_bind(flag);
        }
        qb.push(format!(" RETURNING {COLUMNS}"));

        let row = qb
            .build()
            .fetch_optional(&mut self.conn)
            .await
            .map_err(backend_error)?;
        if let Some(row) = row {
            return Ok(UpdateOutcome::Applied(tuple_from_row(&row)?));
        }
        if guard == Guard::None {
            return Ok(UpdateOutcome::Missing);
        }

        // Nothing matched: tell a missing key from a guard that did not hold.
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM kv_records WHERE key = $1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(backend_error)?;
        Ok(if exists {
            UpdateOutcome::GuardFailed
        } else {
            UpdateOutcome::Missing
        })
    }

    async fn replace(&mut self, tuple: Tuple) -> Result<Tuple, BackendError> {
        let params = params_of(&tuple)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO kv_records ({COLUMNS})"));
        push_values(&mut qb, params);
        qb.push(
            " ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, \
             created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at, \
             deleted_at = EXCLUDED.deleted_at, is_deleted = EXCLUDED.is_deleted",
        );
        qb.push(format!(" RETURNING {COLUMNS}"));

        let row = qb
            .build()
            .fetch_one(&mut self.conn)
            .await
            .map_err(backend_error)?;
        tuple_from_row(&row)
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.conn.ping().await.map_err(backend_error)
    }

    fn close(self) {
        // Dropping closes the socket; no async terminate handshake here.
        drop(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tuple;

    #[test]
    fn params_follow_column_types() {
        let params = params_of(&tuple("k", "v", 1u8, 2i64, 0u64, false)).unwrap();
        assert_eq!(
            params,
            vec![
                Param::Text("k".to_string()),
                Param::Text("v".to_string()),
                Param::Int(1),
                Param::Int(2),
                Param::Int(0),
                Param::Bool(false),
            ]
        );
    }

    #[test]
    fn malformed_tuples_are_protocol_errors() {
        let mut short = tuple("k", "v", 1u8, 2u8, 0u8, false);
        short.pop();
        assert!(matches!(params_of(&short), Err(BackendError::Protocol(_))));

        let wrong = tuple("k", "v", "yesterday", 2u8, 0u8, false);
        assert!(matches!(params_of(&wrong), Err(BackendError::Protocol(_))));
    }

    #[test]
    fn every_field_has_a_column() {
        for i in 0..field::COUNT {
            assert!(column(i).is_some());
        }
        assert!(column(field::COUNT).is_none());
    }
}
