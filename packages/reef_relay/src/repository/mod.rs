// Persistence façade — one repository owning the SQLite pool for all three
// entity tables, with each domain in its own file as `impl Repository`.
// Cross-entity joins (message → room/user, user → rooms) happen inside the
// façade instead of between separately wired repositories.
//
// Cache-first reads take the page cache explicitly; the cache is owned by
// the server loop and never shared across threads.

use sqlx::sqlite::SqlitePool;

mod messages;
mod rooms;
mod users;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use messages::Direction;
pub use users::{RegistrationError, UserColumn, verify_password};

#[derive(Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
