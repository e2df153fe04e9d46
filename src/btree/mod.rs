//! In-memory tables and pages.
//!
//! This is the boundary with page storage: pages are read from images via
//! the block manager, latched and pinned here, and handed to
//! reconciliation which produces new images.

mod image;
mod page;
mod table;

pub use image::{Cell, PageImage, RootEntry, RootImage};
pub use page::{ImageInfo, KeyEntry, Page, PagePin, PageState, PinAttempt};
pub use table::Table;
