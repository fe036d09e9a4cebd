//! Outbound collaborator contracts: geodistance lookups and message transports.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use haulage_core::FacilityId;
use haulage_fleet::{Message, MessageChannel};

#[derive(Debug, Clone, Error)]
pub enum DistanceError {
    #[error("distance service unavailable: {0}")]
    Unavailable(String),
    #[error("no route between {from} and {to}")]
    NoRoute { from: FacilityId, to: FacilityId },
}

#[derive(Debug, Clone, Error)]
#[error("{channel} send failed: {reason}")]
pub struct SendError {
    pub channel: &'static str,
    pub reason: String,
}

impl SendError {
    pub fn new(channel: MessageChannel, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.as_str(),
            reason: reason.into(),
        }
    }
}

/// Road distance in miles between two facilities.
#[async_trait]
pub trait DistanceService: Send + Sync {
    async fn distance(&self, from: FacilityId, to: FacilityId) -> Result<f64, DistanceError>;
}

/// Delivers one outbound message over its channel.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), SendError>;
}

/// Distance service used when no provider is configured: every lookup fails, so
/// loads carry `total_distance = None` instead of a made-up number.
#[derive(Debug, Default, Clone)]
pub struct UnavailableDistance;

#[async_trait]
impl DistanceService for UnavailableDistance {
    async fn distance(&self, _from: FacilityId, _to: FacilityId) -> Result<f64, DistanceError> {
        Err(DistanceError::Unavailable("no distance provider configured".to_string()))
    }
}

/// Fixed distance table (tests/dev). Lookups are symmetric.
#[derive(Debug, Default)]
pub struct StaticDistances {
    table: Mutex<HashMap<(FacilityId, FacilityId), f64>>,
    lookups: Mutex<usize>,
}

impl StaticDistances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, from: FacilityId, to: FacilityId, miles: f64) -> Self {
        if let Ok(mut table) = self.table.lock() {
            table.insert((from, to), miles);
        }
        self
    }

    /// Number of lookups served so far (hits and misses).
    pub fn lookups(&self) -> usize {
        self.lookups.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl DistanceService for StaticDistances {
    async fn distance(&self, from: FacilityId, to: FacilityId) -> Result<f64, DistanceError> {
        if let Ok(mut n) = self.lookups.lock() {
            *n += 1;
        }
        let table = self
            .table
            .lock()
            .map_err(|_| DistanceError::Unavailable("lock poisoned".to_string()))?;
        table
            .get(&(from, to))
            .or_else(|| table.get(&(to, from)))
            .copied()
            .ok_or(DistanceError::NoRoute { from, to })
    }
}

/// Sender that only logs. Used by the host binary until a transport is wired.
#[derive(Debug, Clone, Copy)]
pub struct LoggingSender {
    channel: MessageChannel,
}

impl LoggingSender {
    pub fn new(channel: MessageChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(&self, message: &Message) -> Result<(), SendError> {
        if message.channel() != self.channel {
            return Err(SendError::new(
                self.channel,
                format!("message {} belongs to {}", message.id, message.channel().as_str()),
            ));
        }
        info!(
            channel = self.channel.as_str(),
            message_id = %message.id,
            attempts = message.attempts,
            "message delivered (log transport)"
        );
        Ok(())
    }
}
