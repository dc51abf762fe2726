//! Durable store interface
//!
//! Request/response only; no transactions are assumed across calls.

use async_trait::async_trait;

use crate::domain::cluster::ClusterRecord;
use crate::domain::session::WorkshopSession;
use crate::domain::template::WorkshopTemplate;
use crate::error::Result;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<WorkshopTemplate>;
    /// Insert or replace a template
    async fn put_template(&self, template: &WorkshopTemplate) -> Result<()>;
    async fn list_templates(&self) -> Result<Vec<WorkshopTemplate>>;

    async fn get_session(&self, id: &str) -> Result<WorkshopSession>;
    async fn create_session(&self, session: &WorkshopSession) -> Result<()>;
    async fn update_session(&self, session: &WorkshopSession) -> Result<()>;
    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<WorkshopSession>>;

    async fn get_cluster_records(&self) -> Result<Vec<ClusterRecord>>;
    async fn get_cluster_record(&self, id: &str) -> Result<ClusterRecord>;
    async fn create_cluster_record(&self, record: &ClusterRecord) -> Result<()>;
    async fn update_cluster_record(&self, record: &ClusterRecord) -> Result<()>;
    async fn delete_cluster_record(&self, id: &str) -> Result<()>;
}
