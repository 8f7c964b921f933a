//! # SARA Common Library (sara-common)
//!
//! Shared types for the SARA playout engine: timing conversions, runtime
//! tuning parameters, announcement events, error base, and the playout
//! binary's configuration loader.

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;
pub mod params;
pub mod timing;

pub use error::{CommonError, Result};
pub use events::{Announcement, AnnouncementCategory};
