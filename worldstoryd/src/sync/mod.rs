pub mod backoff;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod manager;
pub mod queue;
pub mod store;

use time::OffsetDateTime;

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
