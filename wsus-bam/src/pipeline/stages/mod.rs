//! Concrete pipeline stages.

pub mod clean;
pub mod extract;
pub mod persist;
pub mod symbols;

pub use clean::CleanStage;
pub use extract::{ExtractMode, ExtractStage};
pub use persist::{PersistStage, PersistStats};
pub use symbols::SymbolStage;
