//! Common utilities and types shared by the relay service and the peer client.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, claims, iat validation)
pub mod jwt;
