pub mod data_dir;
pub mod export;
pub mod history;
pub mod settings;

pub use export::{ExportError, ExportFormat};
pub use history::{Journal, JournalEntry, SessionSummary};
pub use settings::Settings;
