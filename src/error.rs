//! Application-level error taxonomy.
//!
//! Fatal-at-start conditions (missing serial device, MIB load failure, UDP
//! bind failure) surface through `anyhow` context chains in `main` and abort
//! the process with exit code 1. Transient serial and SNMP wire errors are
//! logged where they occur and never propagate past their task.

use thiserror::Error;

/// Errors raised by the MIB resolver and binding registration.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("MIB symbol '{0}' not found")]
    UnknownSymbol(String),

    #[error("invalid numeric OID '{0}'")]
    BadOid(String),
}
