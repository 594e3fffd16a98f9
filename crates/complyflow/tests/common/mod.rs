//! Shared utilities for complyflow integration tests.
//!
//! - `TestHarness`: a pipeline over a temp object store and an in-memory
//!   database
//! - `ScriptedTransport`: a model stand-in replaying canned replies

pub mod harness;
pub mod transport;

pub use harness::{test_config, TestHarness};
pub use transport::{obligations_reply, Route, ScriptedTransport, SUMMARY_REPLY};
