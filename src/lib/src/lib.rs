//! Content credentials for captured media.
//!
//! Capture metadata is sanitized, assembled into a manifest, signed with a
//! keystore-held Ed25519 key and embedded into the asset (or written next to
//! it as a sidecar). The verifier re-derives the hash binding and signature
//! locally and can ask a trust list about the signing certificate.

#![forbid(unsafe_code)]

mod error;

/// Structured audit events (JSON, `tracing`)
pub mod audit;

/// Signing certificates
///
/// Self-signed and CA-issued X.509 certificates carrying the claim-signing
/// and time-stamping extended key usages.
pub mod certificate;

/// Manifest containers
pub mod codec;

pub mod config;

/// Signing identity
///
/// Key generation, rotation and deletion over a [`platform::SecureKeyProvider`].
/// Private keys never leave the provider.
pub mod keys;

/// Manifest model and assembly
pub mod manifest;

pub mod metrics;

/// Keystore backends
///
/// Selected at startup from configuration. Hardware-backed providers plug in
/// behind the same trait as the software fallback.
pub mod platform;

/// Capture metadata sanitization
pub mod sanitize;

/// Secure file operations with restrictive permissions
///
/// Provides utilities for securely reading and writing sensitive files such
/// as the identity record. On Unix systems, it enforces restrictive
/// permissions (0600 = owner read/write only).
pub mod secure_file;

pub mod signing;

/// Time sources
///
/// Certificate validity and trust-cache freshness depend on a clock. Tests
/// and devices without a reliable clock supply their own.
pub mod time;

/// Trust evaluation, trust stores and the remote trust list
pub mod trust;

pub mod verify;

pub use error::PSError;

pub mod reexports {
    pub use {getrandom, log, regex, thiserror};
}
