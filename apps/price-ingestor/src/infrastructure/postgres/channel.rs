//! Broadcast channel over Postgres `LISTEN/NOTIFY`.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPool};

use crate::application::ports::{BroadcastChannelPort, BroadcastError, FrameStream};

/// Broadcast channel over Postgres `LISTEN`/`NOTIFY`.
///
/// `NOTIFY` payloads are capped by the server (8000 bytes by default), so
/// the configured limit must stay below it.
#[derive(Debug, Clone)]
pub struct PgBroadcastChannel {
    pool: PgPool,
    channel: String,
    max_payload_bytes: usize,
}

impl PgBroadcastChannel {
    /// Create a channel named `channel`.
    #[must_use]
    pub fn new(pool: PgPool, channel: impl Into<String>, max_payload_bytes: usize) -> Self {
        Self {
            pool,
            channel: channel.into(),
            max_payload_bytes,
        }
    }
}

#[async_trait]
impl BroadcastChannelPort for PgBroadcastChannel {
    async fn publish(&self, payload: String) -> Result<(), BroadcastError> {
        if payload.len() > self.max_payload_bytes {
            return Err(BroadcastError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BroadcastError::PublishFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<FrameStream, BroadcastError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| BroadcastError::ConnectionError {
                message: e.to_string(),
            })?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| BroadcastError::ConnectionError {
                message: e.to_string(),
            })?;

        tracing::debug!(channel = %self.channel, "Listening for batch frames");

        let stream = listener.into_stream().map(|item| {
            item.map(|notification| notification.payload().to_string())
                .map_err(|e| BroadcastError::ConnectionError {
                    message: e.to_string(),
                })
        });
        Ok(stream.boxed())
    }

    fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }
}
