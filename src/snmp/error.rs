//! Error and status types for the SNMP stack.

use thiserror::Error;

/// Result alias for wire-level SNMP operations.
pub type SnmpResult<T> = Result<T, SnmpError>;

/// Failures inside the SNMP codec and security layers.
///
/// Malformed inbound packets are logged at debug and dropped by the server
/// loop; they never abort the agent.
#[derive(Debug, Error)]
pub enum SnmpError {
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("authentication failed: {0}")]
    Auth(&'static str),

    #[error("crypto failure: {0}")]
    Crypto(&'static str),
}

/// SNMP error-status codes (RFC 3416 Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorStatus {
    NoError = 0,
    TooBig = 1,
    NoSuchName = 2,
    BadValue = 3,
    ReadOnly = 4,
    GenErr = 5,
    NoAccess = 6,
    WrongType = 7,
    NotWritable = 17,
}

impl ErrorStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
