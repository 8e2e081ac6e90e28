/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Frame numbers are signed 64-bit; negative frames are legal in some
/// scene setups and the arithmetic must not assume otherwise.
pub type FrameNumber = i64;
