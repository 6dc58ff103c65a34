//! abs-opds: an OPDS catalog bridge for Audiobookshelf.
//!
//! This crate serves OPDS 1.2 feeds to e-readers like KOReader, backed by
//! the catalog of an Audiobookshelf server. Reader credentials are verified
//! against the upstream and cached as sessions; upstream responses are
//! cached per user.
//!
//! # Features
//!
//! - OPDS 1.2 navigation and acquisition feeds with pagination
//! - Basic (username/password or API key) and Bearer credentials
//! - Session cache with single-flight verification
//! - Catalog cache with optional JSON-lines disk snapshots
//! - Series, collection, author and recently-added feeds
//! - Search with OpenSearch descriptions
//! - Proxied downloads and covers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Credential resolution and sessions.
pub mod auth;
/// Session and catalog cache.
pub mod cache;
/// Configuration and CLI.
pub mod config;
/// Error types.
pub mod error;
/// Catalog model.
pub mod library;
/// OPDS feed generation.
pub mod opds;
/// Page slicing.
pub mod paginate;
/// HTTP server.
pub mod server;
/// Audiobookshelf client.
pub mod upstream;


pub use config::{Cli, Command, Config};
pub use error::{AppError, Result};
pub use server::AppState;
