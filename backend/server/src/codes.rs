//! # Registration Codes
//!
//! Logic behind vehicle registration codes.
//!
//! Every registered vehicle carries a human-readable code of the form
//! `LSH-YY-PPNNNNNN`:
//! - `YY`: last two digits of the registration year
//! - `PP`: 2 characters taken from the license plate, cosmetic only, not
//!   required to be unique on its own
//! - `NNNNNN`: 6-digit zero-padded sequence number, unique within the year
//!   partition
//!
//! ## Allocation
//!
//! - Sequence numbers come from an atomic per-year counter held by the
//!   ledger. The first allocation touching a year partition seeds the
//!   counter from the highest sequence already issued in that partition,
//!   so codes issued before the counters existed stay authoritative.
//! - The full code is checked against the ledger before it is handed out.
//!   Two racing allocations can still compute the same code, so the ledger
//!   write itself ([`Ledger::record_code`]) is the unique-constraint
//!   backstop: one writer wins, the loser gets [`RecordError::Duplicate`]
//!   and has to re-allocate against fresh ledger state.
//! - Sequence numbers may have gaps, never duplicates.
//!
//! ## Degraded mode
//!
//! If the ledger cannot be reached, the sequence falls back to the last 6
//! digits of the current timestamp instead of hard-failing vehicle
//! creation. This weakens uniqueness until the ledger is reachable again,
//! so it is logged at error level and the final collision checks still
//! apply.

use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::error::AppError;

pub const CODE_PREFIX: &str = "LSH";

/// Ephemeral input of one allocation, taken from the vehicle creation flow.
pub struct CodeRequest {
    pub year: i32,
    pub plate: String,
}

#[derive(Debug)]
pub struct AllocatedCode {
    pub code: String,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger scan timed out after {0:?}")]
    ScanTimeout(Duration),
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("code is already registered")]
    Duplicate,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Persisted record of every code ever issued, plus the per-year sequence
/// counters. Issued codes are written once and never mutated or deleted,
/// verification lookups depend on them staying valid forever.
#[allow(async_fn_in_trait)]
pub trait Ledger {
    async fn list_codes_by_year_prefix(&self, prefix: &str) -> Result<Vec<String>, LedgerError>;

    async fn exists(&self, code: &str) -> Result<bool, LedgerError>;

    /// The authoritative write. Must reject a code that was already
    /// recorded with [`RecordError::Duplicate`], even under concurrent
    /// writers.
    async fn record_code(&self, code: &str, year: i32) -> Result<(), RecordError>;

    async fn sequence_initialized(&self, year: i32) -> Result<bool, LedgerError>;

    /// First write wins, later seeds of the same partition are no-ops.
    async fn seed_sequence(&self, year: i32, floor: u32) -> Result<(), LedgerError>;

    async fn bump_sequence(&self, year: i32) -> Result<u32, LedgerError>;
}

pub fn extract_plate_prefix(plate: &str) -> String {
    let clean_re = Regex::new(r"[^A-Za-z0-9]").unwrap();
    let cleaned = clean_re.replace_all(plate, "").to_uppercase();

    let mut prefix: String = cleaned.chars().take(2).collect();
    while prefix.len() < 2 {
        prefix.push('X');
    }

    prefix
}

pub fn partition_key(year: i32) -> String {
    format!("{CODE_PREFIX}-{:02}-", year.rem_euclid(100))
}

/// Sequence number of a full code, `None` for anything that is not 3
/// hyphen-delimited segments with a numeric suffix after the plate prefix.
pub fn parse_sequence(code: &str) -> Option<u32> {
    let segments: Vec<&str> = code.split('-').collect();
    if segments.len() != 3 {
        return None;
    }

    segments[2].get(2..)?.parse().ok()
}

fn format_code(year: i32, prefix: &str, sequence: u32) -> String {
    format!(
        "{CODE_PREFIX}-{:02}-{prefix}{sequence:06}",
        year.rem_euclid(100)
    )
}

fn highest_issued_sequence(codes: &[String]) -> u32 {
    codes
        .iter()
        .filter_map(|code| {
            let sequence = parse_sequence(code);
            if sequence.is_none() {
                warn!("Skipping malformed code in ledger: {code}");
            }
            sequence
        })
        .max()
        .unwrap_or(0)
}

/// Next sequence number for a year partition.
///
/// Never fails: any ledger error degrades to a timestamp-derived sequence
/// so vehicle creation keeps working through an outage. The caller still
/// has to run the collision check and the unique-constraint write.
pub async fn resolve_next_sequence<L: Ledger>(
    ledger: &L,
    year: i32,
    scan_timeout: Duration,
) -> u32 {
    match next_counted_sequence(ledger, year, scan_timeout).await {
        Ok(sequence) => sequence,
        Err(ledger_error) => {
            let sequence = fallback_sequence();
            error!(
                "Ledger unreachable resolving a sequence for year {year}, \
                 degrading to timestamp sequence {sequence}: {ledger_error}"
            );
            sequence
        }
    }
}

async fn next_counted_sequence<L: Ledger>(
    ledger: &L,
    year: i32,
    scan_timeout: Duration,
) -> Result<u32, LedgerError> {
    if !ledger.sequence_initialized(year).await? {
        let floor = backfill_floor(ledger, year, scan_timeout).await?;
        ledger.seed_sequence(year, floor).await?;

        #[cfg(feature = "verbose")]
        tracing::info!("Seeded sequence counter for {} at {floor}", partition_key(year));
    }

    ledger.bump_sequence(year).await
}

/// One-time migration of a year partition onto its counter: scan whatever
/// was issued before the counter existed and start above the highest of it.
async fn backfill_floor<L: Ledger>(
    ledger: &L,
    year: i32,
    scan_timeout: Duration,
) -> Result<u32, LedgerError> {
    let partition = partition_key(year);

    let codes = timeout(scan_timeout, ledger.list_codes_by_year_prefix(&partition))
        .await
        .map_err(|_| LedgerError::ScanTimeout(scan_timeout))??;

    Ok(highest_issued_sequence(&codes))
}

fn fallback_sequence() -> u32 {
    Utc::now().timestamp_millis().rem_euclid(1_000_000) as u32
}

/// Computes a full code for one request and runs the terminal collision
/// check. No internal retry on conflict: a fresh attempt has to re-resolve
/// the sequence against updated ledger state, which is the caller's call.
pub async fn allocate<L: Ledger>(
    ledger: &L,
    scan_timeout: Duration,
    request: &CodeRequest,
) -> Result<AllocatedCode, AppError> {
    let prefix = extract_plate_prefix(&request.plate);
    let sequence = resolve_next_sequence(ledger, request.year, scan_timeout).await;

    let code = format_code(request.year, &prefix, sequence);

    match ledger.exists(&code).await {
        Ok(true) => Err(AppError::CodeConflict(code)),
        Ok(false) => Ok(AllocatedCode { code }),
        Err(ledger_error) => {
            // The record write still enforces uniqueness at the storage level.
            error!("Ledger unreachable for the collision check on {code}: {ledger_error}");
            Ok(AllocatedCode { code })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
        time::Duration,
    };

    use proptest::prelude::*;

    use super::{
        AllocatedCode, CodeRequest, Ledger, LedgerError, RecordError, allocate,
        extract_plate_prefix, highest_issued_sequence, parse_sequence, partition_key,
        resolve_next_sequence,
    };
    use crate::error::AppError;

    const SCAN_TIMEOUT: Duration = Duration::from_millis(200);

    #[derive(Default)]
    struct MemoryLedger {
        codes: Mutex<HashMap<String, i32>>,
        sequences: Mutex<HashMap<String, u32>>,
        offline: bool,
        scan_delay: Option<Duration>,
    }

    impl MemoryLedger {
        fn new() -> Self {
            Self::default()
        }

        fn with_codes(codes: &[&str]) -> Self {
            let ledger = Self::new();
            for code in codes {
                ledger
                    .codes
                    .lock()
                    .unwrap()
                    .insert(code.to_string(), 2025);
            }
            ledger
        }

        fn offline() -> Self {
            Self {
                offline: true,
                ..Self::default()
            }
        }

        fn check_online(&self) -> Result<(), LedgerError> {
            if self.offline {
                return Err(LedgerError::Unavailable("ledger offline".to_string()));
            }
            Ok(())
        }

        fn partition_field(year: i32) -> String {
            format!("{:02}", year.rem_euclid(100))
        }
    }

    impl Ledger for MemoryLedger {
        async fn list_codes_by_year_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<String>, LedgerError> {
            self.check_online()?;

            if let Some(delay) = self.scan_delay {
                tokio::time::sleep(delay).await;
            }

            let codes = self.codes.lock().unwrap();
            Ok(codes
                .keys()
                .filter(|code| code.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn exists(&self, code: &str) -> Result<bool, LedgerError> {
            self.check_online()?;

            Ok(self.codes.lock().unwrap().contains_key(code))
        }

        async fn record_code(&self, code: &str, year: i32) -> Result<(), RecordError> {
            self.check_online()?;

            let mut codes = self.codes.lock().unwrap();
            if codes.contains_key(code) {
                return Err(RecordError::Duplicate);
            }

            codes.insert(code.to_string(), year);
            Ok(())
        }

        async fn sequence_initialized(&self, year: i32) -> Result<bool, LedgerError> {
            self.check_online()?;

            Ok(self
                .sequences
                .lock()
                .unwrap()
                .contains_key(&Self::partition_field(year)))
        }

        async fn seed_sequence(&self, year: i32, floor: u32) -> Result<(), LedgerError> {
            self.check_online()?;

            self.sequences
                .lock()
                .unwrap()
                .entry(Self::partition_field(year))
                .or_insert(floor);
            Ok(())
        }

        async fn bump_sequence(&self, year: i32) -> Result<u32, LedgerError> {
            self.check_online()?;

            let mut sequences = self.sequences.lock().unwrap();
            let sequence = sequences.entry(Self::partition_field(year)).or_insert(0);
            *sequence += 1;
            Ok(*sequence)
        }
    }

    #[test]
    fn test_prefix_basic() {
        assert_eq!(extract_plate_prefix("9412AX05"), "94");
        assert_eq!(extract_plate_prefix("ab-123-cd"), "AB");
        assert_eq!(extract_plate_prefix("  7c  "), "7C");
    }

    #[test]
    fn test_prefix_padding() {
        assert_eq!(extract_plate_prefix("a"), "AX");
        assert_eq!(extract_plate_prefix(""), "XX");
        assert_eq!(extract_plate_prefix("--//"), "XX");
    }

    #[test]
    fn test_partition_key_year_boundaries() {
        assert_eq!(partition_key(2000), "LSH-00-");
        assert_eq!(partition_key(1999), "LSH-99-");
        assert_eq!(partition_key(2025), "LSH-25-");
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("LSH-25-9A000007"), Some(7));
        assert_eq!(parse_sequence("LSH-25-94000001"), Some(1));
        assert_eq!(parse_sequence("garbage-code"), None);
        assert_eq!(parse_sequence("LSH-25-9"), None);
        assert_eq!(parse_sequence("LSH-25-XX00000A"), None);
    }

    proptest! {
        #[test]
        fn prefix_is_deterministic(plate in ".*") {
            prop_assert_eq!(extract_plate_prefix(&plate), extract_plate_prefix(&plate));
        }

        #[test]
        fn prefix_is_two_uppercase_alphanumerics(plate in ".*") {
            let prefix = extract_plate_prefix(&plate);

            prop_assert_eq!(prefix.chars().count(), 2);
            prop_assert!(prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_empty_partition_allocation() {
        let ledger = MemoryLedger::new();
        let request = CodeRequest {
            year: 2025,
            plate: "9412AX05".to_string(),
        };

        let AllocatedCode { code } = allocate(&ledger, SCAN_TIMEOUT, &request).await.unwrap();

        assert_eq!(code, "LSH-25-94000001");
    }

    #[test]
    fn test_scan_skips_codes_it_cannot_parse() {
        let listed: Vec<String> = ["LSH-25-94000001", "LSH-25-41000007", "garbage-code"]
            .iter()
            .map(|code| code.to_string())
            .collect();

        assert_eq!(highest_issued_sequence(&listed), 7);
    }

    #[tokio::test]
    async fn test_resolve_skips_malformed_codes() {
        let ledger =
            MemoryLedger::with_codes(&["LSH-25-94000001", "LSH-25-41000007", "LSH-25-garbage"]);

        assert_eq!(resolve_next_sequence(&ledger, 2025, SCAN_TIMEOUT).await, 8);
    }

    #[tokio::test]
    async fn test_allocation_continues_above_legacy_codes() {
        let ledger =
            MemoryLedger::with_codes(&["LSH-25-94000001", "LSH-25-41000007", "LSH-25-garbage"]);
        let request = CodeRequest {
            year: 2025,
            plate: "9412AX05".to_string(),
        };

        let AllocatedCode { code } = allocate(&ledger, SCAN_TIMEOUT, &request).await.unwrap();

        assert_eq!(code, "LSH-25-94000008");
    }

    #[tokio::test]
    async fn test_malformed_only_neighbor_does_not_abort_resolution() {
        let ledger = MemoryLedger::with_codes(&["LSH-25-AB000041", "LSH-25-XY"]);

        assert_eq!(resolve_next_sequence(&ledger, 2025, SCAN_TIMEOUT).await, 42);
    }

    #[tokio::test]
    async fn test_serial_allocations_are_distinct_and_increasing() {
        let ledger = MemoryLedger::new();
        let mut codes = Vec::new();
        let mut sequences = Vec::new();

        for index in 0..20 {
            let request = CodeRequest {
                year: 2025,
                plate: format!("{index}AB"),
            };

            let AllocatedCode { code } = allocate(&ledger, SCAN_TIMEOUT, &request).await.unwrap();
            ledger.record_code(&code, request.year).await.unwrap();

            sequences.push(parse_sequence(&code).unwrap());
            codes.push(code);
        }

        let distinct: HashSet<&String> = codes.iter().collect();
        assert_eq!(distinct.len(), codes.len());
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_offline_ledger_degrades_to_timestamp_sequence() {
        let ledger = MemoryLedger::offline();

        let sequence = resolve_next_sequence(&ledger, 2025, SCAN_TIMEOUT).await;
        assert!(sequence < 1_000_000);

        let request = CodeRequest {
            year: 2025,
            plate: "9412AX05".to_string(),
        };
        let AllocatedCode { code } = allocate(&ledger, SCAN_TIMEOUT, &request).await.unwrap();

        assert!(code.starts_with("LSH-25-94"));
        assert!(parse_sequence(&code).is_some());
    }

    #[tokio::test]
    async fn test_slow_scan_degrades_to_timestamp_sequence() {
        let ledger = MemoryLedger {
            scan_delay: Some(Duration::from_millis(100)),
            ..MemoryLedger::default()
        };

        let request = CodeRequest {
            year: 2025,
            plate: "9412AX05".to_string(),
        };
        let allocated = allocate(&ledger, Duration::from_millis(5), &request)
            .await
            .unwrap();

        assert!(parse_sequence(&allocated.code).is_some());
    }

    #[tokio::test]
    async fn test_stale_counter_surfaces_conflict() {
        let ledger = MemoryLedger::with_codes(&["LSH-25-94000001"]);
        // A racing writer already recorded sequence 1 while this counter
        // still sits at 0.
        ledger.seed_sequence(2025, 0).await.unwrap();

        let request = CodeRequest {
            year: 2025,
            plate: "9412AX05".to_string(),
        };

        match allocate(&ledger, SCAN_TIMEOUT, &request).await {
            Err(AppError::CodeConflict(code)) => assert_eq!(code, "LSH-25-94000001"),
            other => panic!("Expected a conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_record_code_enforces_uniqueness() {
        let ledger = MemoryLedger::new();

        ledger.record_code("LSH-25-94000001", 2025).await.unwrap();

        assert!(matches!(
            ledger.record_code("LSH-25-94000001", 2025).await,
            Err(RecordError::Duplicate)
        ));
    }
}
