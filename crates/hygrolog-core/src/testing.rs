//! Shared test fixtures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::ffi;

use crate::config::{SensorTarget, DEFAULT_CHARACTERISTIC};
use crate::reading::Reading;
use crate::storage::{ReadingSink, StorageError, StorageResult};

pub const ADDRESS: &str = "A4:C1:38:E6:AD:AD";

pub fn target() -> SensorTarget {
    SensorTarget {
        address: ADDRESS.to_string(),
        characteristic: DEFAULT_CHARACTERISTIC,
    }
}

/// In-memory sink that records every call.
#[derive(Debug, Default)]
pub struct RecordingSink {
    readings: Mutex<Vec<Reading>>,
    cutoffs: Mutex<Vec<DateTime<Utc>>>,
    appends: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingSink {
    /// A sink whose every call fails with a disk-full error.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn appended(&self) -> Vec<Reading> {
        self.readings.lock().unwrap().clone()
    }

    pub fn cutoffs(&self) -> Vec<DateTime<Utc>> {
        self.cutoffs.lock().unwrap().clone()
    }

    pub fn append_calls(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    fn check(&self) -> StorageResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Database(rusqlite::Error::SqliteFailure(
                ffi::Error::new(ffi::SQLITE_FULL),
                Some("database or disk is full".to_string()),
            )));
        }
        Ok(())
    }
}

impl ReadingSink for RecordingSink {
    fn append(&self, reading: &Reading) -> StorageResult<i64> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut readings = self.readings.lock().unwrap();
        readings.push(*reading);
        Ok(i64::try_from(readings.len()).unwrap())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        self.cutoffs.lock().unwrap().push(cutoff);
        self.check()?;
        let mut readings = self.readings.lock().unwrap();
        let before = readings.len();
        readings.retain(|r| r.captured_at() >= cutoff);
        Ok(before - readings.len())
    }
}
