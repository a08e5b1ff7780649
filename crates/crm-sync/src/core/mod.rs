//! Core data model and connector abstractions.
//!
//! - [`record`]: source, transformed and target records, association edges
//! - [`cursor`]: pagination cursors and pages
//! - [`traits`]: the source and target connector traits

pub mod cursor;
pub mod record;
pub mod traits;

pub use cursor::{Cursor, Page, PageRequest, PaginationStyle};
pub use record::{AssociationEdge, SourceRecord, TargetRecord, TransformedRecord};
pub use traits::{BatchItemError, BatchResponse, RawPage, SourceConnector, TargetConnector};
