//! Core types and trait definitions for the strata statistics pipeline.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! importer writes the model defined here, the query engine reads it, and the
//! storage backends implement the traits in [`store`], [`queue`] and [`blob`].

pub mod blob;
pub mod dimension;
pub mod error;
pub mod footnote;
pub mod import;
pub mod message;
pub mod observation;
pub mod query;
pub mod queue;
pub mod store;
pub mod time;

pub use error::{Error, Result};
