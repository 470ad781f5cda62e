//! Driver SPI: the boundary a broker backend implements to be pluggable.
//!
//! Everything above this module depends only on [`Driver`] and [`Session`].
//! Drivers never retry on their own; a failed `send` surfaces as
//! [`Error::Transport`](crate::error::Error::Transport) and the caller decides.

pub mod memory;
pub mod pgmq;

use crate::config::{Config, DriverKind};
use crate::destination::QueueOptions;
use crate::error::{Error, Result};
use crate::message::Message;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

pub use memory::InMemoryDriver;
pub use pgmq::PgmqDriver;

/// A broker implementation.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Declare a physical queue. Idempotent: declaring an existing queue is a no-op.
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    /// Put a message onto a physical queue.
    async fn send(&self, queue: &str, message: &Message) -> Result<()>;

    /// Open a consuming session.
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// A broker connection context for receiving and settling messages.
#[async_trait]
pub trait Session: Send + Sync {
    /// Block up to `timeout` for the next message. `None` on timeout.
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Message>>;

    /// Settle a delivery as done; the broker removes the message.
    async fn acknowledge(&self, message: &Message) -> Result<()>;

    /// Settle a delivery as failed, either back onto the queue or out of it.
    async fn reject(&self, message: &Message, requeue: bool) -> Result<()>;
}

/// Build the driver selected by configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn Driver>> {
    match config.driver {
        DriverKind::Memory => Ok(Arc::new(InMemoryDriver::new())),
        DriverKind::Pgmq => {
            let url = config.database_url.as_ref().ok_or_else(|| {
                Error::Config("DATABASE_URL is required for the pgmq driver".to_string())
            })?;
            let driver = PgmqDriver::connect(url.expose_secret(), config.visibility_timeout).await?;
            driver.migrate().await?;
            Ok(Arc::new(driver))
        }
    }
}
