//! Worker identity rows.

use elara_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `workers` table.
///
/// The credential is issued at registration and presented on every
/// subsequent worker call. Re-registering under the same name rotates
/// it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Worker {
    pub id: DbId,
    pub name: String,
    #[serde(skip_serializing)]
    pub credential: String,
    pub last_seen: Timestamp,
}
