//! Service tests against an in-memory SQLite store and scripted
//! collaborators.

mod dispatcher;

use std::sync::Arc;

use relay_store_sqlite::SqliteStore;

async fn store() -> Arc<SqliteStore> {
  Arc::new(SqliteStore::open_in_memory().await.expect("in-memory store"))
}
