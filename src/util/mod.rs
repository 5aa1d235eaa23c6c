//! Utility functions module
//!
//! Size and duration parsing/formatting shared by the CLI, config and logs.

pub mod units;

pub use units::{
    calculate_throughput_mbps, format_bytes, format_duration, format_rate, format_throughput,
    parse_bytes, parse_duration,
};
