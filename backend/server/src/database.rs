//! # Redis
//!
//! RAM database backing the code ledger.
//!
//! ## Requirements
//!
//! - Atomic increments for the per-year sequence counters
//! - Atomic first-write-wins inserts as the unique constraint on codes
//! - Point lookups for the public verification endpoint
//! - Prefix scans over one year partition for the legacy backfill
//!
//! ## Implementation
//!
//! - Redis hash for codes: 1 big key, then code-year pairs
//! - `HSETNX` rejects a second write of the same code, `HEXISTS` answers
//!   verification lookups
//! - `HSCAN` with a `LSH-YY-*` pattern walks one year partition
//! - Redis hash for sequences: 1 key, then 2-digit-year to last-issued pairs
//! - `HINCRBY` hands out sequence numbers, `HSETNX` seeds a partition
//!   exactly once even when two allocations race the first touch

use std::time::Duration;

use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::codes::{Ledger, LedgerError, RecordError};

pub const CODES_KEY: &str = "vehicle:codes";
pub const SEQUENCES_KEY: &str = "vehicle:seq";

pub async fn init_redis(redis_url: &str) -> ConnectionManager {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url).unwrap();
    let connection_manager = client
        .get_connection_manager_with_config(config)
        .await
        .unwrap();

    connection_manager
}

pub struct RedisLedger {
    connection: ConnectionManager,
}

impl RedisLedger {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    fn partition_field(year: i32) -> String {
        format!("{:02}", year.rem_euclid(100))
    }
}

impl Ledger for RedisLedger {
    async fn list_codes_by_year_prefix(&self, prefix: &str) -> Result<Vec<String>, LedgerError> {
        let mut connection = self.connection.clone();
        let pattern = format!("{prefix}*");

        let mut entries: redis::AsyncIter<'_, (String, i32)> = connection
            .hscan_match(CODES_KEY, &pattern)
            .await
            .map_err(to_ledger_error)?;

        let mut codes = Vec::new();
        while let Some((code, _year)) = entries.next_item().await {
            codes.push(code);
        }

        Ok(codes)
    }

    async fn exists(&self, code: &str) -> Result<bool, LedgerError> {
        let mut connection = self.connection.clone();

        connection
            .hexists(CODES_KEY, code)
            .await
            .map_err(to_ledger_error)
    }

    async fn record_code(&self, code: &str, year: i32) -> Result<(), RecordError> {
        let mut connection = self.connection.clone();

        let inserted: bool = connection
            .hset_nx(CODES_KEY, code, year)
            .await
            .map_err(|redis_error| RecordError::Ledger(to_ledger_error(redis_error)))?;

        if !inserted {
            return Err(RecordError::Duplicate);
        }

        Ok(())
    }

    async fn sequence_initialized(&self, year: i32) -> Result<bool, LedgerError> {
        let mut connection = self.connection.clone();

        connection
            .hexists(SEQUENCES_KEY, Self::partition_field(year))
            .await
            .map_err(to_ledger_error)
    }

    async fn seed_sequence(&self, year: i32, floor: u32) -> Result<(), LedgerError> {
        let mut connection = self.connection.clone();

        let _seeded: bool = connection
            .hset_nx(SEQUENCES_KEY, Self::partition_field(year), floor)
            .await
            .map_err(to_ledger_error)?;

        Ok(())
    }

    async fn bump_sequence(&self, year: i32) -> Result<u32, LedgerError> {
        let mut connection = self.connection.clone();

        connection
            .hincr(SEQUENCES_KEY, Self::partition_field(year), 1)
            .await
            .map_err(to_ledger_error)
    }
}

fn to_ledger_error(redis_error: redis::RedisError) -> LedgerError {
    LedgerError::Unavailable(redis_error.to_string())
}
