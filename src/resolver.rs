//! Bridge to the catalog backend's link resolution.

use crate::models::Episode;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("episode has no gate id to resolve with")]
    MissingGate,
    #[error("link resolution timed out after {0:?}")]
    Timeout(Duration),
    #[error("link resolution failed: {0}")]
    Rejected(String),
}

/// The external `resolveLink(episode) -> url` capability.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn resolve_link(&self, episode: &Episode) -> Result<String, ResolutionError>;
}

/// Treats the episode URL as already resolved. Useful when there is no
/// catalog backend, e.g. for direct links.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl LinkResolver for PassthroughResolver {
    async fn resolve_link(&self, episode: &Episode) -> Result<String, ResolutionError> {
        if episode.url.is_empty() {
            return Err(ResolutionError::Rejected("episode has no url".into()));
        }
        Ok(episode.url.clone())
    }
}

/// One attempt per call, bounded by a timeout. Retrying is up to the caller.
#[derive(Clone)]
pub struct ResolverBridge {
    resolver: Arc<dyn LinkResolver>,
    timeout: Duration,
}

impl ResolverBridge {
    pub fn new(resolver: Arc<dyn LinkResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    pub async fn resolve(&self, episode: &Episode) -> Result<String, ResolutionError> {
        if episode.gate_id.as_deref().map_or(true, str::is_empty) {
            return Err(ResolutionError::MissingGate);
        }
        tracing::info!("resolving link for episode {}", episode.episode_number);
        match tokio::time::timeout(self.timeout, self.resolver.resolve_link(episode)).await {
            Ok(Ok(url)) if url.is_empty() => {
                Err(ResolutionError::Rejected("resolver returned an empty url".into()))
            }
            Ok(result) => result,
            Err(_) => Err(ResolutionError::Timeout(self.timeout)),
        }
    }
}
