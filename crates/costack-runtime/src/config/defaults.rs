//! Compile-time defaults, generated by `build.rs`
//!
//! Override any of them at build time by pointing `COSTACK_CONFIG_RS` at a
//! file of `pub const` lines.

include!(concat!(env!("OUT_DIR"), "/costack_merged_config.rs"));
