pub mod migrations;
pub mod sqlite;

pub use migrations::{Migration, MIGRATIONS, SCHEMA_VERSION};
pub use sqlite::{NewAnalysis, NewArticle, SqliteStore};

pub mod prelude {
    pub use super::sqlite::{NewAnalysis, NewArticle, SqliteStore};
    pub use tia_core::{Error, PersistenceError, Result};
}
