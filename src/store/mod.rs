//! Role & membership store.
//!
//! All reads and writes of principals, organisations, projects and the two
//! membership axes. Writes that carry an invariant run their check in the same
//! transaction (or the same statement) as the write.

pub mod invitations;
pub mod memberships;
pub mod organisations;
pub mod projects;
pub mod sessions;
pub mod users;

use crate::errors::AppError;

/// Maps a unique-index violation to `Conflict`, anything else to `Database`.
pub(crate) fn unique_or(err: sqlx::Error, message: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::conflict(message),
        _ => AppError::Database(err),
    }
}
