//! Postgres-backed session store.
//!
//! SYSTEM CONTEXT
//! ==============
//! Selected at startup when `DATABASE_URL` is set. Schema lives in
//! `src/db/migrations`; the first migration seeds the default session.
//! Points and kind payloads are JSONB; element order is the `seq` column.

use sqlx::PgPool;
use sqlx::types::Json;

use crate::frame::now_ms;
use crate::services::store::{SessionStore, StoreError};
use crate::state::{DrawElement, Element, ElementKind, Point, Session};

type ElementRow = (
    i64,
    i64,
    String,
    String,
    Json<Vec<Point>>,
    String,
    f64,
    Json<serde_json::Map<String, serde_json::Value>>,
    i64,
);

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn element_from_row(row: ElementRow) -> Result<Element, StoreError> {
    let (seq, session_id, element_id, kind, points, color, width, data, created_at) = row;
    let Some(kind) = ElementKind::parse(&kind) else {
        return Err(StoreError::Corrupt(format!("element {seq} has unknown kind {kind:?}")));
    };
    Ok(Element {
        seq,
        session_id,
        created_at,
        element: DrawElement { id: element_id, kind, points: points.0, color, width, data: data.0 },
    })
}

fn session_from_row((id, name, created_at, updated_at): (i64, String, i64, i64)) -> Session {
    Session { id, name, created_at, updated_at }
}

#[async_trait::async_trait]
impl SessionStore for PgStore {
    async fn get_session(&self, session_id: i64) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, (i64, String, i64, i64)>(
            "SELECT id, name, created_at, updated_at FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, i64)>(
            "SELECT id, name, created_at, updated_at FROM sessions ORDER BY updated_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(session_from_row).collect())
    }

    async fn create_session(&self, name: &str) -> Result<Session, StoreError> {
        let now = now_ms();
        let id: i64 =
            sqlx::query_scalar("INSERT INTO sessions (name, created_at, updated_at) VALUES ($1, $2, $2) RETURNING id")
                .bind(name)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(Session { id, name: name.to_owned(), created_at: now, updated_at: now })
    }

    async fn rename_session(&self, session_id: i64, name: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, (i64, String, i64, i64)>(
            "UPDATE sessions SET name = $2, updated_at = GREATEST(updated_at, $3) WHERE id = $1 \
             RETURNING id, name, created_at, updated_at",
        )
        .bind(session_id)
        .bind(name)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    async fn list_elements(&self, session_id: i64) -> Result<Vec<Element>, StoreError> {
        let rows = sqlx::query_as::<_, ElementRow>(
            "SELECT seq, session_id, element_id, kind, points, color, width, data, created_at \
             FROM elements WHERE session_id = $1 ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(element_from_row).collect()
    }

    async fn append_element(&self, session_id: i64, element: DrawElement) -> Result<Element, StoreError> {
        let created_at = now_ms();
        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO elements (session_id, element_id, kind, points, color, width, data, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING seq",
        )
        .bind(session_id)
        .bind(&element.id)
        .bind(element.kind.as_str())
        .bind(Json(&element.points))
        .bind(&element.color)
        .bind(element.width)
        .bind(Json(&element.data))
        .bind(created_at)
        .fetch_one(&self.pool)
        .await;

        let seq = match result {
            Ok(seq) => seq,
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(StoreError::SessionNotFound(session_id));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Element { seq, session_id, created_at, element })
    }

    async fn clear_elements(&self, session_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM elements WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "pg_store_test.rs"]
mod tests;
