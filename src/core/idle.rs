//! Explicit idle state for containers started without a service.
//!
//! Instead of an anonymous `tail -f /dev/null`, the idle process announces
//! itself through a readiness marker whose state is `idle`, so operators and
//! health checks can tell the placeholder apart from a running service.

use crate::utils::error::{BuildError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};

pub const DEFAULT_READY_FILE: &str = "/tmp/breakwater.ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessMarker {
    pub state: IdleState,
    pub pid: u32,
    pub since: DateTime<Utc>,
    /// Service an operator is expected to start by hand, if known.
    pub service: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdleProcess {
    ready_file: PathBuf,
    service: Option<String>,
}

impl IdleProcess {
    pub fn new(ready_file: impl Into<PathBuf>) -> Self {
        Self {
            ready_file: ready_file.into(),
            service: None,
        }
    }

    pub fn with_service(mut self, service: Option<String>) -> Self {
        self.service = service;
        self
    }

    /// 寫入 readiness 標記，等待 shutdown 後移除
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let marker = ReadinessMarker {
            state: IdleState::Idle,
            pid: std::process::id(),
            since: Utc::now(),
            service: self.service.clone(),
        };

        if let Some(parent) = self.ready_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.ready_file, serde_json::to_vec_pretty(&marker)?).await?;

        tracing::warn!(
            "💤 Idle placeholder running (pid {}); no service has been started{}",
            marker.pid,
            self.service
                .as_deref()
                .map(|s| format!(", start '{}' manually", s))
                .unwrap_or_default()
        );
        tracing::info!("📍 Readiness marker: {}", self.ready_file.display());

        shutdown.await;

        tracing::info!("🛑 Shutdown requested, leaving idle state");
        match tokio::fs::remove_file(&self.ready_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolves on SIGINT, or on SIGTERM where available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Reads the readiness marker; an absent or malformed marker is an error.
pub async fn probe(ready_file: &Path) -> Result<ReadinessMarker> {
    let data = tokio::fs::read(ready_file).await.map_err(|e| BuildError::VerificationError {
        message: format!("readiness marker {} unavailable: {}", ready_file.display(), e),
    })?;
    serde_json::from_slice(&data).map_err(|e| BuildError::VerificationError {
        message: format!("readiness marker {} is malformed: {}", ready_file.display(), e),
    })
}
