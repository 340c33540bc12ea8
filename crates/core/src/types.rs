/// Users are identified by the backend's UUID primary key.
pub type UserId = uuid::Uuid;

/// Check-in and coupon rows are keyed by UUID as well.
pub type RecordId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
