//! # Vassago Core
//!
//! Core types for the Vassago serving control plane.
//!
//! This crate provides the abstractions shared by every other Vassago component:
//! - The error taxonomy and its flat [`ErrorKind`] classification
//! - Network endpoints and port pairs handed out to backends
//! - Registry entries describing a loaded model

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::*;
