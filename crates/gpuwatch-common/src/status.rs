//! Unified status codes.
//!
//! Local operation failures and transport failures live in two disjoint
//! ranges of one `u32` space. Local codes start at `0` (success); transport
//! codes are shifted by [`StatusCode::TRANSPORT_BASE`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failures produced by the daemon itself.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalCode {
    Ok = 0,
    NotSupported,
    TelemetryError,
    FailLoadModule,
    InvalidHandle,
    BadParameter,
    NotFound,
    Conflict,
    ClientError,
    AlreadyExists,
    ResourceExhausted,
    PermissionDenied,
    Timeout,
    Internal,
}

impl LocalCode {
    const ALL: [LocalCode; 14] = [
        LocalCode::Ok,
        LocalCode::NotSupported,
        LocalCode::TelemetryError,
        LocalCode::FailLoadModule,
        LocalCode::InvalidHandle,
        LocalCode::BadParameter,
        LocalCode::NotFound,
        LocalCode::Conflict,
        LocalCode::ClientError,
        LocalCode::AlreadyExists,
        LocalCode::ResourceExhausted,
        LocalCode::PermissionDenied,
        LocalCode::Timeout,
        LocalCode::Internal,
    ];

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    fn description(self) -> &'static str {
        match self {
            LocalCode::Ok => "success",
            LocalCode::NotSupported => "the feature is not supported on this system",
            LocalCode::TelemetryError => "the telemetry library reported an error",
            LocalCode::FailLoadModule => "failed to load a telemetry module",
            LocalCode::InvalidHandle => "invalid session handle",
            LocalCode::BadParameter => "a parameter is invalid",
            LocalCode::NotFound => "the requested item was not found",
            LocalCode::Conflict => "the resource is busy or conflicts with current state",
            LocalCode::ClientError => "client side error",
            LocalCode::AlreadyExists => "the item already exists",
            LocalCode::ResourceExhausted => "a maximum limit was reached",
            LocalCode::PermissionDenied => "permission denied",
            LocalCode::Timeout => "the operation timed out",
            LocalCode::Internal => "internal error",
        }
    }
}

/// Transport failures, numbered by the conventional RPC status ordinals.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCode {
    Ok = 0,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl TransportCode {
    const ALL: [TransportCode; 17] = [
        TransportCode::Ok,
        TransportCode::Cancelled,
        TransportCode::Unknown,
        TransportCode::InvalidArgument,
        TransportCode::DeadlineExceeded,
        TransportCode::NotFound,
        TransportCode::AlreadyExists,
        TransportCode::PermissionDenied,
        TransportCode::ResourceExhausted,
        TransportCode::FailedPrecondition,
        TransportCode::Aborted,
        TransportCode::OutOfRange,
        TransportCode::Unimplemented,
        TransportCode::Internal,
        TransportCode::Unavailable,
        TransportCode::DataLoss,
        TransportCode::Unauthenticated,
    ];

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    fn description(self) -> &'static str {
        match self {
            TransportCode::Ok => "success",
            TransportCode::Cancelled => "transport: the operation was cancelled",
            TransportCode::Unknown => "transport: unknown error",
            TransportCode::InvalidArgument => "transport: the client specified an invalid argument",
            TransportCode::DeadlineExceeded => "transport: deadline expired before the operation completed",
            TransportCode::NotFound => "transport: the requested entity was not found",
            TransportCode::AlreadyExists => "transport: the entity already exists",
            TransportCode::PermissionDenied => "transport: the caller lacks permission",
            TransportCode::ResourceExhausted => "transport: some resource has been exhausted",
            TransportCode::FailedPrecondition => "transport: the system is not in a state required for the operation",
            TransportCode::Aborted => "transport: the operation was aborted",
            TransportCode::OutOfRange => "transport: the operation was attempted past the valid range",
            TransportCode::Unimplemented => "transport: the operation is not implemented",
            TransportCode::Internal => "transport: internal error",
            TransportCode::Unavailable => "transport: the service is unavailable",
            TransportCode::DataLoss => "transport: unrecoverable data loss or corruption",
            TransportCode::Unauthenticated => "transport: the request lacks valid credentials",
        }
    }
}

/// A status in the unified space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0);
    pub const TRANSPORT_BASE: u32 = 1000;
    pub const UNKNOWN: StatusCode = StatusCode(u32::MAX);

    pub fn is_ok(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn is_transport(self) -> bool {
        self.0 >= Self::TRANSPORT_BASE && self != Self::UNKNOWN
    }

    pub fn local(self) -> Option<LocalCode> {
        LocalCode::from_u32(self.0)
    }

    pub fn transport(self) -> Option<TransportCode> {
        if self.is_ok() {
            return Some(TransportCode::Ok);
        }
        if !self.is_transport() {
            return None;
        }
        TransportCode::from_u32(self.0 - Self::TRANSPORT_BASE)
            .filter(|code| *code != TransportCode::Ok)
    }

    /// Human readable text for any value; unmapped values fall back to
    /// `"unknown error"`.
    pub fn description(self) -> &'static str {
        if self.is_transport() {
            return self.transport().map(TransportCode::description).unwrap_or("unknown error");
        }
        self.local().map(LocalCode::description).unwrap_or("unknown error")
    }
}

impl From<LocalCode> for StatusCode {
    fn from(code: LocalCode) -> Self {
        StatusCode(code as u32)
    }
}

impl From<TransportCode> for StatusCode {
    fn from(code: TransportCode) -> Self {
        match code {
            TransportCode::Ok => StatusCode::SUCCESS,
            other => StatusCode(Self::TRANSPORT_BASE + other as u32),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.0)
    }
}
