//! Library layout and per-item materialization.

mod claims;
mod materializer;
mod naming;

pub use claims::{ClaimGuard, FolderClaims};
pub use materializer::{
    ItemPaths, MaterializeSummary, Materializer, SEASON_METADATA_FILE, SHOW_METADATA_FILE,
};
pub use naming::{NamingConfig, PathNamer, TemplateNamer};
