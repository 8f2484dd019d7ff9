//! External collaborators: archive extraction, PE validation and symbol
//! resolution, each behind a trait with a concrete adapter.

pub mod expand;
pub mod pe;
pub mod symbol_source;
pub mod traits;

pub use expand::{ExpandExtractor, PE_EXTENSIONS};
pub use pe::{CodeView, ImageKind, PeImage, PeValidator};
pub use symbol_source::{
    DEFAULT_SYMBOL_SERVER, HttpSymbolSource, LocalSymbolSource, SymbolStoreSource,
    symbol_source_from,
};
pub use traits::{BinaryIdentity, BinaryValidator, Extractor, SymbolSource};
