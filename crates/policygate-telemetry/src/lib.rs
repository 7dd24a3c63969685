//! PolicyGate Telemetry
//!
//! Audit trail functionality for PolicyGate.
//!
//! Provides:
//! - A hash-chained audit trail for denied and remediated decisions
//! - Optional JSON-lines persistence of audit events

pub mod audit;

pub use audit::{AuditError, AuditEvent, AuditLog, AuditSeverity, AuditTrail};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditLog, AuditSeverity};
}
