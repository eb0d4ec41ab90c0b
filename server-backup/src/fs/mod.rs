//! Local filesystem helpers.

pub mod walker;

pub use walker::{slash_path, walk_files, FileInfo};
