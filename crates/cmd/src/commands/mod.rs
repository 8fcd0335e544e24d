pub mod append;
pub mod cat;
pub mod compact;
pub mod schema;

pub use append::append_command;
pub use cat::cat_command;
pub use compact::{CompactArgs, compact_command};
pub use schema::schema_command;
