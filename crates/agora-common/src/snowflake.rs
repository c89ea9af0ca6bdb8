//! Call and candidate id generation.
//!
//! Ids are UUID v7: time-sortable and generated on either device without
//! coordination, so the caller can mint a call id before the row exists.

use uuid::Uuid;

/// Generate a new time-sortable id.
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}
