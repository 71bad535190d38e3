//! Core types and utilities for the scadalink messaging runtime
//!
//! This crate provides the fundamental types shared by every layer of the
//! runtime: the `Message` wire unit and its typed field values, the
//! administrative command codes, the error taxonomy, and the string-keyed
//! connection configuration surface.

pub mod error;
pub mod message;
pub mod options;

pub use error::{LinkError, LinkResult};
pub use message::{codes, fields, Message, Value};
pub use options::ConnectionOptions;
