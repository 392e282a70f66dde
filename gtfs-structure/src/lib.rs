/*! The [General Transit Feed Specification](https://gtfs.org/) (GTFS) is a commonly used model to represent public transit data.

This crates brings [serde](https://serde.rs) structures of this model and helpers to read and write GTFS files.

To get started, see [GtfsReader] and [Feed].

## What is GTFS

A Gtfs feed is a collection of CSV files (often bundled as a zip file).
Each file represents a collection of one type (stops, lines, etc.) that have relationships through unique identifiers.

## Design decisions

### One flat representation

A [Feed] holds the objects as close as possible to their CSV representation: one `Vec` per file,
relations kept as plain identifiers. Nothing is checked when reading, so that a feed with dangling
references can still be loaded, inspected and repaired.

### Use of Enum

Many values are integers that are actually enumerations of certain values. We use Rust enums, like [LocationType] to represent them, and not the integer value.
Values outside of the reference are kept (see [RouteType::Other]) so that a feed is written back as it was read.

### Renaming

We kept some names even if they can be confusing (a [Calendar] will be referenced by `service_id`), but we strip the object type (`route_short_name` is [Route::short_name]).

*/
#![warn(missing_docs)]

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate serde_derive;

mod enums;
pub mod error;
mod feed;
mod gtfs_reader;
mod gtfs_writer;
pub(crate) mod objects;
mod serde_helpers;


pub use error::Error;
pub use feed::Feed;
pub use gtfs_reader::{GtfsReader, ReadFeed};
pub use gtfs_writer::GtfsWriter;
pub use objects::*;
pub use serde_helpers::{format_time, parse_time};
