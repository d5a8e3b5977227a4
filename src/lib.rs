#![forbid(unsafe_code)]

//! Subtitle catalog for externally hosted videos.
//!
//! The crate keeps a SQLite catalog of videos (referenced by URL, never
//! stored) and their subtitle tracks, converts uploaded WebVTT into SRT, and
//! resolves YouTube URLs to the ids used for lookups. The `subbed` binary
//! serves all of it over HTTP.

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod resolver;
pub mod service;
pub mod subtitle;
