//! Time-unit clock: maps epochs to wall-clock time and to bucket/partition
//! boundaries.
//!
//! Buckets are aligned to UTC midnight, not to epoch zero. The genesis offset
//! is the number of whole epochs between the preceding UTC midnight and
//! genesis; shifting every epoch by it before bucketing puts the bucket edges
//! on midnight. The first bucket after genesis is therefore shorter than a
//! full bucket.

use chrono::{DateTime, TimeZone, Utc};

pub const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeUnitClock {
    genesis_timestamp: i64,
    seconds_per_unit: u64,
    units_per_bucket: u64,
    buckets_per_partition: u64,
    genesis_offset: u64,
}

impl TimeUnitClock {
    /// Clock with one bucket per UTC day
    pub fn daily(genesis_timestamp: i64, seconds_per_unit: u64, buckets_per_partition: u64) -> Self {
        Self::new(
            genesis_timestamp,
            seconds_per_unit,
            SECONDS_PER_DAY / seconds_per_unit,
            buckets_per_partition,
        )
    }

    pub fn new(
        genesis_timestamp: i64,
        seconds_per_unit: u64,
        units_per_bucket: u64,
        buckets_per_partition: u64,
    ) -> Self {
        let since_midnight = genesis_timestamp.rem_euclid(SECONDS_PER_DAY as i64) as u64;
        Self {
            genesis_timestamp,
            seconds_per_unit,
            units_per_bucket,
            buckets_per_partition,
            genesis_offset: since_midnight / seconds_per_unit,
        }
    }

    /// Override the genesis offset; 0 puts bucket edges on epoch zero
    pub fn with_genesis_offset(mut self, offset: u64) -> Self {
        self.genesis_offset = offset;
        self
    }

    pub fn units_per_bucket(&self) -> u64 {
        self.units_per_bucket
    }

    pub fn seconds_per_unit(&self) -> u64 {
        self.seconds_per_unit
    }

    pub fn genesis_offset(&self) -> u64 {
        self.genesis_offset
    }

    /// `[start, end)` of the bucket containing `unit`, in unit space.
    pub fn bucket_bounds(&self, unit: u64) -> (u64, u64) {
        let offset = self.genesis_offset;
        let width = self.units_per_bucket;
        let shifted = unit + offset;
        let mut start = shifted / width * width; // inclusive
        let end = start + width; // exclusive
        if start < offset {
            start = offset; // nothing before genesis
        }
        (start - offset, end - offset)
    }

    /// Wall-clock `[start, end)` of the partition covering `unit`.
    pub fn partition_bounds(&self, unit: u64) -> (DateTime<Utc>, DateTime<Utc>) {
        let span = self.buckets_per_partition * self.units_per_bucket;
        let start = unit / span * span;
        let end = start + span;
        (self.unit_to_time(start), self.unit_to_time(end))
    }

    pub fn unit_to_time(&self, unit: u64) -> DateTime<Utc> {
        unit.checked_mul(self.seconds_per_unit)
            .and_then(|offset| i64::try_from(offset).ok())
            .and_then(|offset| self.genesis_timestamp.checked_add(offset))
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Identifier stored in the `bucket` column: start time of the bucket
    pub fn bucket_key(&self, unit: u64) -> DateTime<Utc> {
        let (start, _) = self.bucket_bounds(unit);
        self.unit_to_time(start)
    }
}
