//! 64-bit identifiers for connections and issued users, backed by sonyflake.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sonyflake::Sonyflake;
use thiserror::Error;

/// 2024-12-25T00:00:00Z
const EPOCH_UNIX_SECS: i64 = 1_735_084_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum IdError {
    #[error("system clock is before the id epoch")]
    ClockBeforeEpoch,
    #[error("id time budget exhausted")]
    OverTimeLimit,
    #[error("id generator failed: {0}")]
    Generator(sonyflake::Error),
}

impl From<sonyflake::Error> for IdError {
    fn from(err: sonyflake::Error) -> Self {
        match err {
            sonyflake::Error::StartTimeAheadOfCurrentTime(_) => IdError::ClockBeforeEpoch,
            sonyflake::Error::OverTimeLimit => IdError::OverTimeLimit,
            other => IdError::Generator(other),
        }
    }
}

/// Shared id source. Ids carry the machine id in their low 16 bits.
#[derive(Clone)]
pub struct IdGenerator {
    inner: Sonyflake,
}

impl IdGenerator {
    pub fn new(machine_id: u16) -> Result<Self, IdError> {
        let epoch = DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(EPOCH_UNIX_SECS);
        Self::with_start_time(epoch, machine_id)
    }

    pub fn with_start_time(start_time: DateTime<Utc>, machine_id: u16) -> Result<Self, IdError> {
        let machine = move || -> Result<u16, Box<dyn std::error::Error + Send + Sync>> {
            Ok(machine_id)
        };
        let inner = Sonyflake::builder()
            .start_time(start_time)
            .machine_id(&machine)
            .finalize()?;
        Ok(Self { inner })
    }

    pub fn next_id(&self) -> Result<u64, IdError> {
        Ok(self.inner.next_id()?)
    }

    pub fn next_connection_id(&self) -> Result<ConnectionId, IdError> {
        self.next_id().map(ConnectionId)
    }
}
