//! HTTP control surface for order imports.

pub mod app;
