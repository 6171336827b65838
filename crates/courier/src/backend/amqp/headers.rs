//! Job metadata carried in message headers
//!
//! Integers travel as 64-bit signed values and durations in whole
//! milliseconds, rounded up so a non-zero duration never reads back as zero.
//! Reading is lenient: a missing or mistyped field reads as zero, so odd
//! metadata never blocks a delivery.

use super::channel::{AmqpValue, FieldTable};
use crate::job::{Job, Options};
use bytes::Bytes;
use std::time::Duration;

const ID: &str = "x-job-id";
const NAME: &str = "x-job-name";
const ATTEMPT: &str = "x-job-attempt";
const ATTEMPTS: &str = "x-job-attempts";
const TIMEOUT: &str = "x-job-timeout";
const DELAY: &str = "x-job-delay";
const RETRY_DELAY: &str = "x-job-retry-delay";

pub fn pack(id: &str, attempt: u32, job: &Job) -> FieldTable {
    let opts = &job.options;
    FieldTable::from([
        (ID.to_string(), AmqpValue::from(id)),
        (NAME.to_string(), AmqpValue::from(job.name.as_str())),
        (ATTEMPT.to_string(), AmqpValue::Long(attempt.into())),
        (ATTEMPTS.to_string(), AmqpValue::Long(opts.attempts.into())),
        (TIMEOUT.to_string(), millis(opts.timeout)),
        (DELAY.to_string(), millis(opts.delay)),
        (RETRY_DELAY.to_string(), millis(opts.retry_delay)),
    ])
}

/// Restore `(id, attempt, job)` from headers and body.
pub fn unpack(headers: &FieldTable, body: Bytes) -> (String, u32, Job) {
    let options = Options {
        attempts: count(headers, ATTEMPTS),
        timeout: duration(headers, TIMEOUT),
        delay: duration(headers, DELAY),
        retry_delay: duration(headers, RETRY_DELAY),
    };

    let job = Job {
        name: string(headers, NAME),
        payload: body,
        options,
    };

    (string(headers, ID), count(headers, ATTEMPT), job)
}

fn millis(d: Duration) -> AmqpValue {
    AmqpValue::Long(i64::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(i64::MAX))
}

fn string(headers: &FieldTable, key: &str) -> String {
    match headers.get(key) {
        Some(AmqpValue::Str(s)) => s.clone(),
        _ => String::new(),
    }
}

fn long(headers: &FieldTable, key: &str) -> i64 {
    match headers.get(key) {
        Some(AmqpValue::Long(v)) => *v,
        _ => 0,
    }
}

fn count(headers: &FieldTable, key: &str) -> u32 {
    u32::try_from(long(headers, key)).unwrap_or(0)
}

fn duration(headers: &FieldTable, key: &str) -> Duration {
    u64::try_from(long(headers, key))
        .map(Duration::from_millis)
        .unwrap_or_default()
}
