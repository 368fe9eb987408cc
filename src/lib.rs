pub mod comparator;
pub mod config;
pub mod database;
pub mod error;
pub mod judge;
pub mod language;
pub mod queue;
pub mod sandbox;
pub mod scoring;
pub mod service;
pub mod store;
pub mod verdict;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The instant `age` ago, formatted like `create_timestamp`
pub fn timestamp_before(age: std::time::Duration) -> String {
    use chrono::{DateTime, SecondsFormat, Utc};
    let now = Utc::now();
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
