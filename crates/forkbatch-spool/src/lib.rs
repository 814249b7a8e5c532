//! Directory-backed job queue shared between a worker and its forked children.
//!
//! Every job is one JSON file. Reservation is an atomic `rename` out of the
//! queue directory, so any number of processes can reserve from the same
//! spool without further coordination.

mod spool;

pub use spool::SpoolQueue;
