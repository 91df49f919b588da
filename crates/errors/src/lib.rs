//! Shared error classification for the sync core.
//!
//! Any fallible operation that should surface a specific error on the wire
//! (§7 of the protocol spec) attaches an [`ErrorMetadata`] to its
//! `anyhow::Error` via `.context(..)`. Callers at the protocol boundary read
//! it back out with [`ErrorMetadataAnyhowExt`] to build the `{code,
//! message}` payload that goes out in an `error` frame.
use std::borrow::Cow;

mod metrics;

/// Attach to an `anyhow` error chain via `.context(..)` to classify it for
/// the wire. The `msg` is shown to the user; `short_msg` is a stable,
/// ScreamingCamelCase tag usable in tests and dashboards without being
/// sensitive to copy changes.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

/// The error taxonomy observable at the wire boundary (spec §7).
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed frame, unknown `type`, or missing required field.
    ParseError,
    /// Input rejected by the operation's validator.
    ValidationError,
    /// Reference to an unregistered operation or entity.
    NotFound,
    /// Host-supplied policy rejection.
    Unauthorized,
    /// Resolver threw.
    ExecutionError,
    /// A received `patch`/`delta`/`array` update could not be applied
    /// cleanly to local state (version skew or corrupted history).
    PatchApplicationError,
    /// Invariant violated (e.g. contiguous-version broken, encoder produced
    /// a larger-than-value payload). May terminate the connection.
    InternalError,
}

impl ErrorMetadata {
    pub fn parse_error(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ParseError,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn validation_error(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ValidationError,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn unauthorized(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthorized,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn execution_error(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ExecutionError,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn patch_application_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::PatchApplicationError,
            short_msg: Cow::Borrowed("PatchApplicationError"),
            msg: msg.into(),
        }
    }

    pub fn internal_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            short_msg: Cow::Borrowed("InternalError"),
            msg: msg.into(),
        }
    }

    /// The lowercase-with-underscores tag used in `{type: "error", error:
    /// {code, ...}}` wire frames (spec §4.9/§7).
    pub fn wire_code(&self) -> &'static str {
        self.code.wire_code()
    }

    pub fn custom_metric(&self) -> &'static prometheus::IntCounter {
        self.code.custom_metric()
    }
}

impl ErrorCode {
    pub fn wire_code(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse_error",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::ExecutionError => "execution_error",
            ErrorCode::PatchApplicationError => "patch_application_error",
            ErrorCode::InternalError => "internal_error",
        }
    }

    /// Whether the connection may need to be torn down after this error, per
    /// spec §7's propagation policy. Only `internal_error` warrants it; every
    /// other kind leaves the connection open.
    pub fn may_terminate_connection(&self) -> bool {
        matches!(self, ErrorCode::InternalError)
    }

    fn custom_metric(&self) -> &'static prometheus::IntCounter {
        match self {
            ErrorCode::ParseError => &metrics::PARSE_ERROR_TOTAL,
            ErrorCode::ValidationError => &metrics::VALIDATION_ERROR_TOTAL,
            ErrorCode::NotFound => &metrics::NOT_FOUND_ERROR_TOTAL,
            ErrorCode::Unauthorized => &metrics::UNAUTHORIZED_ERROR_TOTAL,
            ErrorCode::ExecutionError => &metrics::EXECUTION_ERROR_TOTAL,
            ErrorCode::PatchApplicationError => &metrics::PATCH_APPLICATION_ERROR_TOTAL,
            ErrorCode::InternalError => &metrics::INTERNAL_ERROR_TOTAL,
        }
    }
}

/// A `{code, message}` pair ready to serialize into an `error` wire frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&ErrorMetadata> for ErrorPayload {
    fn from(e: &ErrorMetadata) -> Self {
        ErrorPayload {
            code: e.wire_code().to_owned(),
            message: e.msg.to_string(),
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    /// Extract the attached [`ErrorMetadata`], if any.
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    /// Build the wire `{code, message}` payload, defaulting to
    /// `internal_error` for errors with no attached classification.
    fn error_payload(&self) -> ErrorPayload;
    fn wire_code(&self) -> &'static str;
    fn may_terminate_connection(&self) -> bool;
    /// Bump the counter for this error's classification.
    fn record_metric(&self);
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn error_payload(&self) -> ErrorPayload {
        match self.error_metadata() {
            Some(e) => e.into(),
            None => ErrorPayload {
                code: ErrorCode::InternalError.wire_code().to_owned(),
                message: INTERNAL_SERVER_ERROR_MSG.to_owned(),
            },
        }
    }

    fn wire_code(&self) -> &'static str {
        self.error_metadata()
            .map(|e| e.wire_code())
            .unwrap_or_else(|| ErrorCode::InternalError.wire_code())
    }

    fn may_terminate_connection(&self) -> bool {
        self.error_metadata()
            .map(|e| e.code.may_terminate_connection())
            .unwrap_or(true)
    }

    fn record_metric(&self) {
        match self.error_metadata() {
            Some(e) => e.custom_metric().inc(),
            None => ErrorCode::InternalError.custom_metric().inc(),
        }
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|code| match code {
                    ErrorCode::ParseError => ErrorMetadata::parse_error("Bad", "bad frame"),
                    ErrorCode::ValidationError => {
                        ErrorMetadata::validation_error("Invalid", "invalid input")
                    },
                    ErrorCode::NotFound => ErrorMetadata::not_found("Missing", "not found"),
                    ErrorCode::Unauthorized => {
                        ErrorMetadata::unauthorized("Denied", "unauthorized")
                    },
                    ErrorCode::ExecutionError => {
                        ErrorMetadata::execution_error("Threw", "resolver threw")
                    },
                    ErrorCode::PatchApplicationError => {
                        ErrorMetadata::patch_application_error("could not apply patch")
                    },
                    ErrorCode::InternalError => ErrorMetadata::internal_error("invariant broken"),
                })
                .boxed()
        }
    }
}
