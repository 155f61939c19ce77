//! Worker process launcher seam.
//!
//! Starting agent processes is owned by the host environment. The core only
//! needs the handle a launcher returns, which tells the connection pool which
//! logical id to expect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{ConductorError, Result};
use crate::messaging::EndpointRole;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHandle {
    pub agent_id: String,
    pub role: EndpointRole,
    pub launched_at: DateTime<Utc>,
    pub process_id: Option<u32>,
}

impl WorkerHandle {
    pub fn new(agent_id: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            launched_at: Utc::now(),
            process_id: None,
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, agent_id: &str, role: EndpointRole) -> Result<WorkerHandle>;
}

/// Launcher for agents started out of band; it only records the expectation
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalLauncher;

#[async_trait]
impl WorkerLauncher for ExternalLauncher {
    async fn launch(&self, agent_id: &str, role: EndpointRole) -> Result<WorkerHandle> {
        if agent_id.trim().is_empty() {
            return Err(ConductorError::validation_field(
                "Agent id cannot be empty",
                "agentId",
            ));
        }
        info!(agent_id = agent_id, role = %role, "🚀 Expecting externally launched worker");
        Ok(WorkerHandle::new(agent_id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_external_launcher() {
        let handle = ExternalLauncher
            .launch("agent-3", EndpointRole::Agent)
            .await
            .unwrap();
        assert_eq!(handle.agent_id, "agent-3");
        assert!(handle.process_id.is_none());
        assert!(ExternalLauncher.launch(" ", EndpointRole::Agent).await.is_err());
    }
}
