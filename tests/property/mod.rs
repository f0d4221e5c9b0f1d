// tests/property/mod.rs

//! Property-based tests for liveroom
//!
//! These tests use property-based testing to verify invariants that should
//! always hold, regardless of input values.

pub mod position_test;
