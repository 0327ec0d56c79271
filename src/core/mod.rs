//! Core modules shared by every pluginctl command.
//!
//! Store layout, configuration, logging, the database broker and the error
//! type live here. Plugin lifecycle logic lives in [`crate::plugins`].

pub mod broker;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod output;
pub mod schemas;
pub mod store;
pub mod time;
