mod cursor;
mod database;
mod environment;
mod registry;

pub use cursor::{Cursor, Iter};
pub use database::{Database, DbStat};
pub use environment::Environment;
