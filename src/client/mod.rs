//! The `client` module is the load-generating side of the benchmark.
//!
//! It opens many concurrent connections to a server, checks each greeting,
//! then sends numbered messages one at a time and times every round trip.

pub mod bench_client;
pub use bench_client::{BenchConfig, BenchReport, run_bench};
