pub mod contexts;
pub mod database;
pub mod error;
pub mod records;
pub mod row_helpers;
pub mod schema;
pub mod tool_hints;

pub use contexts::ContextRepo;
pub use database::Database;
pub use error::StoreError;
pub use records::{Atomicity, RecordRepo};
pub use tool_hints::ToolHintRepo;
