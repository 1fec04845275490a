//! feedscout - package metadata resolution across NuGet sources
//!
//! This crate finds the package sources configured for a directory, talks to
//! each of them (negotiating credentials with provider plugins when a source
//! requires authentication) and resolves version, framework, advisory and
//! download information for many packages at once.

pub mod auth;
pub mod backend;
pub mod config;
pub mod framework;
pub mod registries;
pub mod resolver;
pub mod routing;
pub mod sources;
pub mod version;
