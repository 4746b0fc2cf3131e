//! Failure mapper.
//!
//! Canonicalizes domain errors into `(HTTP status, client-safe message)`
//! pairs and into gRPC codes. This is the only place in the crate that is
//! allowed to know about HTTP status codes or gRPC status codes — every
//! other component returns an [`ApiError`].

use std::fmt;

/// Domain error kinds. Not a type hierarchy — a closed set, matched
/// exhaustively wherever a caller needs to branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    QuotaExceeded,
    Unavailable,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// HTTP status this kind maps to. `http_status_to_grpc` below reads
    /// the equivalent table right-to-left (status -> kind); this is its
    /// inverse.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::QuotaExceeded => 429,
            ErrorKind::Unavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// gRPC status code. `GrpcCode` is a local stand-in
    /// for `tonic::Code` so this module has no hard dependency on tonic;
    /// `From<ErrorKind> for tonic::Code` lives next to the gRPC service.
    pub fn grpc_code(self) -> GrpcCode {
        http_status_to_grpc(self.http_status())
    }
}

/// Mirrors `tonic::Code`'s numbering, kept decoupled so `error.rs` has no
/// dependency on the gRPC stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCode {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    FailedPrecondition,
    DeadlineExceeded,
    Unimplemented,
    Unavailable,
    Internal,
}

/// Total function covering every status this crate produces, including the
/// "other 4xx" and ">=500" fallback rows.
pub fn http_status_to_grpc(status: u16) -> GrpcCode {
    match status {
        400 | 422 => GrpcCode::InvalidArgument,
        401 => GrpcCode::Unauthenticated,
        403 => GrpcCode::PermissionDenied,
        404 => GrpcCode::NotFound,
        409 => GrpcCode::AlreadyExists,
        429 => GrpcCode::ResourceExhausted,
        412 => GrpcCode::FailedPrecondition,
        408 | 504 => GrpcCode::DeadlineExceeded,
        501 => GrpcCode::Unimplemented,
        502 | 503 => GrpcCode::Unavailable,
        s if s >= 500 => GrpcCode::Internal,
        s if (400..500).contains(&s) => GrpcCode::InvalidArgument,
        _ => GrpcCode::Internal,
    }
}

/// `{kind, clientMsg, cause}` — a tagged variant, not an exception.
/// `cause` is logged and traced but never serialized into a response body.
#[derive(Debug, thiserror::Error)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub client_msg: String,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, client_msg: impl Into<String>) -> Self {
        Self {
            kind,
            client_msg: client_msg.into(),
            cause: None,
        }
    }

    pub fn with_cause(kind: ErrorKind, client_msg: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            kind,
            client_msg: client_msg.into(),
            cause: Some(cause),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, msg)
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, msg)
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.client_msg)
    }
}

/// Lets internal glue keep using `anyhow::Result` and `?` up to the
/// component boundary, then get classified as `Internal` unless the
/// component already attached a more specific kind.
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::with_cause(ErrorKind::Internal, "internal error", e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
