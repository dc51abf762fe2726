//! SQLite database layer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

use super::store::Store;
use crate::domain::cluster::{ClusterCapacity, ClusterCredential, ClusterRecord, ClusterStatus};
use crate::domain::environment::BackendType;
use crate::domain::session::{SessionStatus, StepProgress, WorkshopSession};
use crate::domain::template::WorkshopTemplate;
use crate::error::{Error, Result};

fn parse_time(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn parse_optional_time(field: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_time(field, &r)).transpose()
}

/// Database row for a session
#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    template_id: String,
    user_id: String,
    environment_id: Option<String>,
    backend: String,
    status: String,
    current_step: i64,
    progress: String,
    total_score: i64,
    started_at: String,
    expires_at: String,
    completed_at: Option<String>,
    last_activity: String,
}

impl TryFrom<SessionRow> for WorkshopSession {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let backend = BackendType::from_str(&row.backend)
            .ok_or_else(|| Error::Internal(format!("Invalid backend: {}", row.backend)))?;
        let status = SessionStatus::from_str(&row.status)
            .ok_or_else(|| Error::Internal(format!("Invalid session status: {}", row.status)))?;
        let progress: Vec<StepProgress> = serde_json::from_str(&row.progress)
            .map_err(|e| Error::Internal(format!("Failed to parse progress: {}", e)))?;

        Ok(WorkshopSession {
            id: row.id,
            template_id: row.template_id,
            user_id: row.user_id,
            environment_id: row.environment_id,
            backend,
            status,
            current_step: row.current_step as usize,
            progress,
            total_score: row.total_score as u32,
            started_at: parse_time("started_at", &row.started_at)?,
            expires_at: parse_time("expires_at", &row.expires_at)?,
            completed_at: parse_optional_time("completed_at", row.completed_at)?,
            last_activity: parse_time("last_activity", &row.last_activity)?,
        })
    }
}

/// Database row for a registered cluster
#[derive(Debug, FromRow)]
struct ClusterRow {
    id: String,
    name: String,
    endpoint: String,
    credential: String,
    namespace: String,
    is_default: bool,
    status: String,
    status_message: Option<String>,
    last_health_check: Option<String>,
    capacity: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ClusterRow> for ClusterRecord {
    type Error = Error;

    fn try_from(row: ClusterRow) -> Result<Self> {
        let credential: ClusterCredential = serde_json::from_str(&row.credential)
            .map_err(|e| Error::Internal(format!("Failed to parse credential: {}", e)))?;
        let status = ClusterStatus::from_str(&row.status)
            .ok_or_else(|| Error::Internal(format!("Invalid cluster status: {}", row.status)))?;
        let capacity: ClusterCapacity = serde_json::from_str(&row.capacity)
            .map_err(|e| Error::Internal(format!("Failed to parse capacity: {}", e)))?;

        Ok(ClusterRecord {
            id: row.id,
            name: row.name,
            endpoint: row.endpoint,
            credential,
            namespace: row.namespace,
            is_default: row.is_default,
            status,
            status_message: row.status_message,
            last_health_check: parse_optional_time("last_health_check", row.last_health_check)?,
            capacity,
            created_at: parse_time("created_at", &row.created_at)?,
            updated_at: parse_time("updated_at", &row.updated_at)?,
        })
    }
}

const SESSION_COLUMNS: &str = "id, template_id, user_id, environment_id, backend, status, current_step, \
     progress, total_score, started_at, expires_at, completed_at, last_activity";

const CLUSTER_COLUMNS: &str = "id, name, endpoint, credential, namespace, is_default, status, \
     status_message, last_health_check, capacity, created_at, updated_at";

/// [`Store`] backed by SQLite
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database connection pool
    pub async fn init(database_url: &str) -> anyhow::Result<SqlitePool> {
        // Ensure parent directory exists
        if let Some(path) = database_url.strip_prefix("sqlite:") {
            if let Some(path) = path.split('?').next() {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(pool)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_template(&self, id: &str) -> Result<WorkshopTemplate> {
        let (body,): (String,) = sqlx::query_as("SELECT body FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))?;

        serde_json::from_str(&body)
            .map_err(|e| Error::Internal(format!("Failed to parse template {}: {}", id, e)))
    }

    async fn put_template(&self, template: &WorkshopTemplate) -> Result<()> {
        let body = serde_json::to_string(template)?;

        sqlx::query(
            r#"
            INSERT INTO templates (id, name, body, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<WorkshopTemplate>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT body FROM templates ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(body,)| {
                serde_json::from_str(&body)
                    .map_err(|e| Error::Internal(format!("Failed to parse template: {}", e)))
            })
            .collect()
    }

    async fn get_session(&self, id: &str) -> Result<WorkshopSession> {
        let row: SessionRow =
            sqlx::query_as(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        row.try_into()
    }

    async fn create_session(&self, session: &WorkshopSession) -> Result<()> {
        let progress = serde_json::to_string(&session.progress)?;

        sqlx::query(&format!(
            "INSERT INTO sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SESSION_COLUMNS
        ))
        .bind(&session.id)
        .bind(&session.template_id)
        .bind(&session.user_id)
        .bind(&session.environment_id)
        .bind(session.backend.as_str())
        .bind(session.status.as_str())
        .bind(session.current_step as i64)
        .bind(&progress)
        .bind(session.total_score as i64)
        .bind(session.started_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .bind(session.completed_at.map(|t| t.to_rfc3339()))
        .bind(session.last_activity.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_session(&self, session: &WorkshopSession) -> Result<()> {
        let progress = serde_json::to_string(&session.progress)?;

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET environment_id = ?, status = ?, current_step = ?, progress = ?, total_score = ?,
                expires_at = ?, completed_at = ?, last_activity = ?
            WHERE id = ?
            "#,
        )
        .bind(&session.environment_id)
        .bind(session.status.as_str())
        .bind(session.current_step as i64)
        .bind(&progress)
        .bind(session.total_score as i64)
        .bind(session.expires_at.to_rfc3339())
        .bind(session.completed_at.map(|t| t.to_rfc3339()))
        .bind(session.last_activity.to_rfc3339())
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(session.id.clone()));
        }

        Ok(())
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<WorkshopSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions WHERE user_id = ? ORDER BY started_at DESC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn get_cluster_records(&self) -> Result<Vec<ClusterRecord>> {
        let rows: Vec<ClusterRow> = sqlx::query_as(&format!(
            "SELECT {} FROM clusters ORDER BY created_at",
            CLUSTER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn get_cluster_record(&self, id: &str) -> Result<ClusterRecord> {
        let row: ClusterRow =
            sqlx::query_as(&format!("SELECT {} FROM clusters WHERE id = ?", CLUSTER_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;

        row.try_into()
    }

    async fn create_cluster_record(&self, record: &ClusterRecord) -> Result<()> {
        let credential = serde_json::to_string(&record.credential)?;
        let capacity = serde_json::to_string(&record.capacity)?;

        sqlx::query(&format!(
            "INSERT INTO clusters ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            CLUSTER_COLUMNS
        ))
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.endpoint)
        .bind(&credential)
        .bind(&record.namespace)
        .bind(record.is_default)
        .bind(record.status.as_str())
        .bind(&record.status_message)
        .bind(record.last_health_check.map(|t| t.to_rfc3339()))
        .bind(&capacity)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_cluster_record(&self, record: &ClusterRecord) -> Result<()> {
        let credential = serde_json::to_string(&record.credential)?;
        let capacity = serde_json::to_string(&record.capacity)?;

        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET name = ?, endpoint = ?, credential = ?, namespace = ?, is_default = ?, status = ?,
                status_message = ?, last_health_check = ?, capacity = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.name)
        .bind(&record.endpoint)
        .bind(&credential)
        .bind(&record.namespace)
        .bind(record.is_default)
        .bind(record.status.as_str())
        .bind(&record.status_message)
        .bind(record.last_health_check.map(|t| t.to_rfc3339()))
        .bind(&capacity)
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ClusterNotFound(record.id.clone()));
        }

        Ok(())
    }

    async fn delete_cluster_record(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ClusterNotFound(id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::{CreateClusterParams, TokenCredential};

    async fn create_test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        SqliteStore::new(pool)
    }

    fn template(id: &str, name: &str) -> WorkshopTemplate {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "steps": [{"id": "s1", "kind": "instruction"}]
        }))
        .expect("valid template")
    }

    #[tokio::test]
    async fn test_put_and_get_template() {
        let store = create_test_store().await;
        store.put_template(&template("t1", "First")).await.unwrap();
        store.put_template(&template("t1", "Renamed")).await.unwrap();
        store.put_template(&template("t2", "Another")).await.unwrap();

        let fetched = store.get_template("t1").await.unwrap();
        assert_eq!(fetched.name, "Renamed");
        assert_eq!(fetched.steps.len(), 1);
        assert_eq!(store.list_templates().await.unwrap().len(), 2);

        let err = store.get_template("missing").await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn test_session_round_trip_and_update() {
        let store = create_test_store().await;
        let mut session = WorkshopSession::new(
            "s1".into(),
            "t1".into(),
            "alice".into(),
            BackendType::Cluster,
            ["a", "b"],
            30,
        );
        store.create_session(&session).await.unwrap();

        session.assign_environment("env-1");
        session.transition_to(SessionStatus::Active);
        session.record_attempt(0, true, 10, "ok".into());
        store.update_session(&session).await.unwrap();

        let fetched = store.get_session("s1").await.unwrap();
        assert_eq!(fetched.status, SessionStatus::Active);
        assert_eq!(fetched.environment_id.as_deref(), Some("env-1"));
        assert_eq!(fetched.current_step, 1);
        assert_eq!(fetched.total_score, 10);
        assert!(fetched.progress[0].completed);
        assert_eq!(fetched.backend, BackendType::Cluster);

        let listed = store.list_sessions_for_user("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_sessions_for_user("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_session_is_not_found() {
        let store = create_test_store().await;
        let session = WorkshopSession::new(
            "ghost".into(),
            "t1".into(),
            "u".into(),
            BackendType::Container,
            ["a"],
            30,
        );
        let err = store.update_session(&session).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_cluster_record_lifecycle() {
        let store = create_test_store().await;
        let mut record = ClusterRecord::new(
            "c1".into(),
            CreateClusterParams {
                name: "primary".into(),
                endpoint: "https://k8s.local".into(),
                credential: ClusterCredential::Token(TokenCredential::new("secret")),
                namespace: "default".into(),
                is_default: true,
            },
        );
        store.create_cluster_record(&record).await.unwrap();

        record.status = ClusterStatus::Connected;
        record.capacity.node_count = 3;
        record.last_health_check = Some(Utc::now());
        store.update_cluster_record(&record).await.unwrap();

        let fetched = store.get_cluster_record("c1").await.unwrap();
        assert_eq!(fetched.status, ClusterStatus::Connected);
        assert_eq!(fetched.capacity.node_count, 3);
        assert!(fetched.is_default);
        assert_eq!(fetched.credential, ClusterCredential::Token(TokenCredential::new("secret")));

        store.delete_cluster_record("c1").await.unwrap();
        assert!(store.get_cluster_records().await.unwrap().is_empty());
        let err = store.delete_cluster_record("c1").await.unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound(_)));
    }
}
