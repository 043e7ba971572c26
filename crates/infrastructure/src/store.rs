use application::{MessageStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{MessageId, MessageRecord, RoomId, UserId};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

const MESSAGE_ROOM_FK: &str = "messages_room_id_fkey";

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_foreign_key_violation() && db.constraint() == Some(MESSAGE_ROOM_FK) {
            return StoreError::RoomNotFound;
        }
    }
    StoreError::storage(err.to_string())
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    room_id: i64,
    user_id: i64,
    username: String,
    content: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MessageRow> for MessageRecord {
    fn from(value: MessageRow) -> Self {
        MessageRecord {
            id: MessageId::new(value.id),
            room_id: RoomId::new(value.room_id),
            user_id: UserId::new(value.user_id),
            username: value.username,
            content: value.content,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

/// PostgreSQL 消息仓储
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn check_membership(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM room_users ru
                JOIN rooms r ON r.id = ru.room_id AND r.deleted_at IS NULL
                WHERE ru.room_id = $1 AND ru.user_id = $2
            )
            "#,
        )
        .bind(i64::from(room_id))
        .bind(i64::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn create(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        // 插入与作者名查询在同一条语句中完成
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            WITH inserted AS (
                INSERT INTO messages (room_id, user_id, content)
                VALUES ($1, $2, $3)
                RETURNING id, room_id, user_id, content, created_at, updated_at
            )
            SELECT i.id, i.room_id, i.user_id, u.username, i.content, i.created_at, i.updated_at
            FROM inserted i
            JOIN users u ON u.id = i.user_id
            "#,
        )
        .bind(i64::from(room_id))
        .bind(i64::from(user_id))
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.into())
    }

    async fn username(&self, user_id: UserId) -> Result<String, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT username FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(i64::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(StoreError::UserNotFound)
    }
}
