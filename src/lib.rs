//! SNMP agent for offline UPS hardware speaking the Megatec/Voltronic Q1
//! serial protocol.
//!
//! The agent polls the UPS over a 2400-8N1 serial link, decodes the Q1
//! response frames, mirrors the telemetry into the UPS-MIB (RFC 1628)
//! object model, serves SNMP v1/v2c/v3 Get/GetNext/GetBulk/Set against it
//! and emits `upsTrapAlarmEntryAdded` / `upsTrapAlarmEntryRemoved` traps on
//! alarm-table edges.

pub mod alarm;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod mib;
pub mod model;
pub mod poll;
pub mod proto;
pub mod serial;
pub mod snmp;
