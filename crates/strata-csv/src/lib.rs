//! Data-file and meta-CSV codec for strata.
//!
//! Converts between CSV bytes and [`strata_core`] domain types. Pure
//! synchronous; no HTTP or database dependencies.
//!
//! # Quick start
//!
//! ```no_run
//! use strata_csv::{DataHeader, RowParser, parse_meta};
//!
//! let meta = parse_meta(b"col_name,col_type,label\nenrolments,Indicator,Enrolments\n").unwrap();
//! let data = b"time_period,time_identifier,geographic_level,country_code,country_name,enrolments\n\
//!              2020,Calendar year,National,E92000001,England,4500\n";
//! let parser = RowParser::new(DataHeader::read(data).unwrap(), &meta).unwrap();
//! let (rows, errors) = parser.parse_all(data, true, 1).unwrap();
//! assert_eq!((rows.len(), errors.len()), (1, 0));
//! ```

pub mod batch;
pub mod data;
pub mod error;
pub mod export;
pub mod meta;

pub use batch::{Batch, batch_count, count_rows, first_row_of, split_batches};
pub use data::{DataHeader, FilterValue, ParsedRow, RowParser, is_valid_indicator_value};
pub use error::{Error, Result, RowError};
pub use export::ExportWriter;
pub use meta::{MetaFilter, MetaIndicator, MetaSchema, parse_meta};
