mod dormant_database;
mod mysql;
mod proxysql;
mod shared;
mod snapshot;
mod stash;

pub use dormant_database::*;
pub use mysql::*;
pub use proxysql::*;
pub use shared::*;
pub use snapshot::*;
pub use stash::*;
