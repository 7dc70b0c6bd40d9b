//! Mock booking backend.
//!
//! Synthesizes a plausible booking result from the confirmed identifiers. The
//! output is a pure function of `(reference, token, now)`: the identifiers are
//! hashed with xxh3 and the hash picks the container, yard slot and gate time.

use std::time::Duration;
use time::{OffsetDateTime, UtcOffset, macros::format_description};
use xxhash_rust::xxh3::xxh3_64;

/// Default simulated backend latency.
pub const DEFAULT_PROCESSING_DELAY: Duration = Duration::from_millis(1500);

/// Owner prefixes used for synthesized container numbers. The equipment
/// category letter `U` is appended.
const OWNER_CODES: [&str; 8] = ["CSQ", "MSK", "MSC", "HLX", "CMA", "TGH", "OOL", "EMC"];

/// Yard blocks, rows and tiers.
const BLOCKS: u64 = 8;
const ROWS: u64 = 40;
const TIERS: u64 = 5;

/// Gate slots are 15 minutes wide and start at least 30 minutes out.
const SLOT_MINUTES: i64 = 15;
const EARLIEST_SLOT_MINUTES: i64 = 30;
const SLOT_COUNT: u64 = 14;

/// Synthesized booking result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    pub container_number: String,
    pub location: String,
    pub gate_time: String,
}

/// Deterministic stand-in for the booking backend.
#[derive(Debug, Clone)]
pub struct MockFulfillment {
    processing_delay: Duration,
}

impl Default for MockFulfillment {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSING_DELAY)
    }
}

impl MockFulfillment {
    pub fn new(processing_delay: Duration) -> Self {
        Self { processing_delay }
    }

    pub fn processing_delay(&self) -> Duration {
        self.processing_delay
    }

    /// Wait out the processing delay, then synthesize against the current time.
    pub async fn fulfill(&self, reference: &str, token: &str) -> Fulfillment {
        if !self.processing_delay.is_zero() {
            tokio::time::sleep(self.processing_delay).await;
        }
        let fulfillment = self.synthesize(reference, token, OffsetDateTime::now_utc());
        tracing::info!(
            container = %fulfillment.container_number,
            location = %fulfillment.location,
            gate_time = %fulfillment.gate_time,
            "Booking fulfilled"
        );
        fulfillment
    }

    /// Synthesize a booking for the given identifiers at `now`.
    pub fn synthesize(&self, reference: &str, token: &str, now: OffsetDateTime) -> Fulfillment {
        let seed = xxh3_64(format!("{reference}:{token}").as_bytes());

        Fulfillment {
            container_number: container_number(seed),
            location: yard_location(seed),
            gate_time: gate_time(seed, now),
        }
    }
}

fn container_number(seed: u64) -> String {
    let owner = OWNER_CODES[(seed % OWNER_CODES.len() as u64) as usize];
    let serial = (seed >> 8) % 1_000_000;
    let code = format!("{owner}U{serial:06}");
    // The code is built from uppercase letters and digits, so the check digit always exists.
    let check = iso6346_check_digit(&code).unwrap_or(0);
    format!("{code}{check}")
}

fn yard_location(seed: u64) -> String {
    let block = (b'A' + ((seed >> 28) % BLOCKS) as u8) as char;
    let row = (seed >> 32) % ROWS + 1;
    let tier = (seed >> 40) % TIERS + 1;
    format!("Block {block}, Row {row:02}, Tier {tier}")
}

fn gate_time(seed: u64, now: OffsetDateTime) -> String {
    let slot = (seed >> 48) % SLOT_COUNT;
    let offset = EARLIEST_SLOT_MINUTES + SLOT_MINUTES * slot as i64;
    let earliest = now.to_offset(UtcOffset::UTC) + time::Duration::minutes(offset);

    // Round up to the next quarter hour.
    let minute = earliest.minute();
    let floored = earliest
        .replace_minute(minute - minute % SLOT_MINUTES as u8)
        .and_then(|t| t.replace_second(0))
        .and_then(|t| t.replace_nanosecond(0))
        .unwrap_or(earliest);
    let gate = if floored < earliest {
        floored + time::Duration::minutes(SLOT_MINUTES)
    } else {
        floored
    };

    let format = format_description!("[year]-[month]-[day] [hour]:[minute] UTC");
    gate.format(&format).unwrap_or_else(|_| gate.to_string())
}

/// ISO 6346 check digit for a 10-character owner code + serial.
///
/// Returns `None` unless `code` is four uppercase letters followed by six
/// digits.
pub fn iso6346_check_digit(code: &str) -> Option<u32> {
    let bytes = code.as_bytes();
    if bytes.len() != 10 {
        return None;
    }

    let mut sum: u32 = 0;
    for (position, &b) in bytes.iter().enumerate() {
        let value = if position < 4 {
            letter_value(b)?
        } else if b.is_ascii_digit() {
            u32::from(b - b'0')
        } else {
            return None;
        };
        sum += value << position;
    }
    Some(sum % 11 % 10)
}

/// Letter values start at A=10 and skip multiples of 11.
fn letter_value(letter: u8) -> Option<u32> {
    if !letter.is_ascii_uppercase() {
        return None;
    }
    let mut value = 10;
    for _ in b'A'..letter {
        value += 1;
        if value % 11 == 0 {
            value += 1;
        }
    }
    Some(value)
}
