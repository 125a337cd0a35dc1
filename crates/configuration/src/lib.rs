//! Hierarchical configuration stored in an Arakoon cluster.
//!
//! [`ArakoonConfiguration`] emulates directories over the flat key space and
//! moves whole subtrees atomically. [`Configuration`] adds JSON documents
//! with `key|path.inside.document` addressing on top.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod document;
mod error;
mod store;

pub use document::{Configuration, to_document};
pub use error::Error;
pub use store::{ArakoonConfiguration, DEFAULT_RENAME_RETRIES, ListStream, clean_key};
