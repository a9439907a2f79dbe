use std::{io::ErrorKind, path::PathBuf};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::ClientEvent;

/// Bearer token attached to every backend request, optionally persisted in a file.
pub struct AuthSession {
    token: RwLock<Option<String>>,
    persisted_at: Option<PathBuf>,
    events: Option<broadcast::Sender<ClientEvent>>,
}

impl AuthSession {
    pub fn anonymous() -> Self {
        Self {
            token: RwLock::new(None),
            persisted_at: None,
            events: None,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            persisted_at: None,
            events: None,
        }
    }

    /// Reads the token file. A missing or blank file yields an anonymous session.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let token = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Some(raw.trim().to_string()).filter(|token| !token.is_empty()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read token file '{}'", path.display()))
            }
        };

        Ok(Self {
            token: RwLock::new(token),
            persisted_at: Some(path),
            events: None,
        })
    }

    pub fn notify(mut self, events: broadcast::Sender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Drops the token after the backend refused it, and sends the user back to login.
    pub async fn invalidate(&self) {
        let had_token = self.token.write().await.take().is_some();

        if let Some(path) = &self.persisted_at {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(path = %path.display(), "session: removed persisted token"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    path = %path.display(),
                    %err,
                    "session: failed to remove persisted token"
                ),
            }
        }

        info!(had_token, "session: token invalidated; login required");
        if let Some(events) = &self.events {
            let _ = events.send(ClientEvent::SessionExpired);
        }
    }
}
