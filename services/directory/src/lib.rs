//! Canopy directory service library crate.
//!
//! # Purpose
//! Exposes the entry repository (durable store, cache index, filter
//! translator, changelog), configuration and observability for use by the
//! binary and tests. The LDAP wire protocol and request handlers are
//! external collaborators; they drive the repository through
//! [`repo::Repository`].
pub mod config;
pub mod observability;
pub mod repo;
