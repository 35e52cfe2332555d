// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for scriba.
//!
//! Every service error carries an [`ErrorKind`] (a machine-readable, stable
//! tag that maps onto exactly one HTTP status), a human-readable message, an
//! optional cause chain, and arbitrary key-value context. Use the builder
//! returned by [`ServiceError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error kind.
///
/// Each variant serialises to a `snake_case` string that is guaranteed not
/// to change across patch releases, and maps onto exactly one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed form data, unsupported media, unknown quality profile.
    Validation,
    /// Missing or invalid credentials.
    Auth,
    /// Unknown job, or a job owned by someone else (indistinguishable).
    NotFound,
    /// Upload exceeds the configured size limit.
    PayloadTooLarge,
    /// Duplicate signup or similar uniqueness violation.
    Conflict,
    /// The broker backend was requested but is unreachable.
    UpstreamUnavailable,
    /// Engine crash, storage I/O, or any other unexpected failure.
    Internal,
}

impl ErrorKind {
    /// HTTP status code this kind maps onto.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::PayloadTooLarge => 413,
            Self::UpstreamUnavailable => 503,
            Self::Internal => 500,
        }
    }

    /// Stable `&'static str` representation (e.g. `"payload_too_large"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Conflict => "conflict",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Unified scriba service error.
///
/// Carries a stable [`ErrorKind`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use scriba_error::{ErrorKind, ServiceError};
///
/// let err = ServiceError::new(ErrorKind::PayloadTooLarge, "upload exceeds limit")
///     .with_context("max_upload_mb", 512)
///     .with_context("received_bytes", 540_000_000);
/// assert_eq!(err.status(), 413);
/// ```
pub struct ServiceError {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ServiceError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Shorthand for a [`ErrorKind::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Shorthand for a [`ErrorKind::NotFound`] error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for a [`ErrorKind::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.kind.status()`.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.kind.status()
    }
}

impl fmt::Debug for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ServiceError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`ServiceError`] (without the opaque source),
/// used as the HTTP error body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// Error kind tag.
    pub error: ErrorKind,
    /// Human-readable message.
    pub detail: String,
    /// Structured context, omitted when empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&ServiceError> for ErrorBody {
    fn from(err: &ServiceError) -> Self {
        Self {
            error: err.kind,
            detail: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::Validation,
        ErrorKind::Auth,
        ErrorKind::NotFound,
        ErrorKind::PayloadTooLarge,
        ErrorKind::Conflict,
        ErrorKind::UpstreamUnavailable,
        ErrorKind::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = ServiceError::new(ErrorKind::Internal, "boom");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::Validation.status(), 400);
        assert_eq!(ErrorKind::Auth.status(), 401);
        assert_eq!(ErrorKind::NotFound.status(), 404);
        assert_eq!(ErrorKind::Conflict.status(), 409);
        assert_eq!(ErrorKind::PayloadTooLarge.status(), 413);
        assert_eq!(ErrorKind::Internal.status(), 500);
        assert_eq!(ErrorKind::UpstreamUnavailable.status(), 503);
    }

    #[test]
    fn display_without_context() {
        let err = ServiceError::not_found("no such job");
        assert_eq!(err.to_string(), "[not_found] no such job");
    }

    #[test]
    fn display_with_context() {
        let err = ServiceError::validation("bad profile").with_context("profile", "ultra");
        let s = err.to_string();
        assert!(s.starts_with("[validation] bad profile"));
        assert!(s.contains("ultra"));
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = ServiceError::internal("download failed").with_source(src);
        let chained = std::error::Error::source(&err).unwrap();
        assert_eq!(chained.to_string(), "file missing");
    }

    #[test]
    fn kind_serde_roundtrip() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!(r#""{}""#, kind.as_str()));
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *kind);
        }
    }

    #[test]
    fn all_kinds_have_unique_strings_and_statuses_are_sane() {
        let mut seen = HashSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.as_str()));
            let status = kind.status();
            assert!((400..=599).contains(&status));
        }
    }

    #[test]
    fn body_roundtrip() {
        let err = ServiceError::new(ErrorKind::Conflict, "email taken").with_context("email", "a@b");
        let body: ErrorBody = (&err).into();
        let json = serde_json::to_string(&body).unwrap();
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn body_omits_empty_context() {
        let err = ServiceError::internal("boom");
        let body: ErrorBody = (&err).into();
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("context"));
    }
}
