//! Stats HTTP surface and process wiring for the orderflow binaries.

pub mod app;
