//! Trap emission to configured destinations.
//!
//! Every destination owns a persistent connected socket and its own protocol
//! version; one broadcast builds the version-appropriate message per
//! destination. A destination failing to send is reported and skipped, it
//! never blocks delivery to the others.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use super::agent::Engine;
use super::error::{SnmpError, SnmpResult};
use super::message::{
    encode_v1_trap, CommunityMessage, MsgFlags, MsgGlobalData, ScopedPdu, SecurityLevel, V3Message,
    Version,
};
use super::pdu::{Pdu, TrapV1Pdu, GENERIC_ENTERPRISE_SPECIFIC};
use super::usm::{
    authenticate_message, DerivedKeys, SaltCounter, UsmSecurityParams, UsmUser,
};
use super::value::{Value, VarBind};
use crate::oid;
use crate::snmp::oid::Oid;

/// Per-send deadline; a dead receiver must not stall the poll thread's
/// alarm apply for longer than this.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// sysUpTime.0
fn sys_uptime_oid() -> Oid {
    oid!(1, 3, 6, 1, 2, 1, 1, 3, 0)
}

/// snmpTrapOID.0
fn snmp_trap_oid() -> Oid {
    oid!(1, 3, 6, 1, 6, 3, 1, 1, 4, 1, 0)
}

/// Split a trap OID into (enterprise, specific trap number): enterprise is
/// every arc but the last, the final arc is the specific number, so joining
/// them reproduces the input.
pub fn split_trap_oid(trap_oid: &Oid) -> SnmpResult<(Oid, i32)> {
    let specific = trap_oid
        .last_arc()
        .ok_or(SnmpError::InvalidOid(String::new()))?;
    let enterprise = trap_oid.parent().expect("non-empty checked above");
    Ok((enterprise, specific as i32))
}

/// One alarm-table edge to announce.
#[derive(Debug, Clone)]
pub struct TrapEvent {
    /// upsTrapAlarmEntryAdded / upsTrapAlarmEntryRemoved, resolved.
    pub trap_oid: Oid,
    /// upsAlarmId column OID.
    pub alarm_id_oid: Oid,
    /// upsAlarmDescr column OID.
    pub alarm_descr_oid: Oid,
    /// Index of the alarm entry.
    pub index: i32,
    /// The alarm's well-known OID.
    pub alarm_oid: Oid,
}

/// A configured trap receiver.
pub struct TrapDestination {
    pub label: String,
    pub version: Version,
    pub community: Vec<u8>,
    user: Option<(UsmUser, DerivedKeys)>,
    socket: UdpSocket,
}

impl TrapDestination {
    /// Resolve and connect. Connection failure is surfaced to the caller,
    /// which reports it and keeps the agent running without this target.
    pub async fn connect(
        host: &str,
        port: u16,
        version: Version,
        community: Vec<u8>,
        user: Option<UsmUser>,
        engine: &Engine,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;
        let user = user.map(|u| {
            let keys = u.derive_keys(engine.id());
            (u, keys)
        });
        Ok(Self {
            label: format!("{}:{}", host, port),
            version,
            community,
            user,
            socket,
        })
    }
}

/// Trap sender shared by the alarm path.
pub struct TrapSender {
    engine: Arc<Engine>,
    destinations: Vec<TrapDestination>,
    salt: SaltCounter,
}

impl TrapSender {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            destinations: Vec::new(),
            salt: SaltCounter::new(),
        }
    }

    pub fn add_destination(&mut self, destination: TrapDestination) {
        tracing::info!(target: "snmp::trap", destination = %destination.label,
            version = ?destination.version, "trap destination registered");
        self.destinations.push(destination);
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Send one trap to every destination. Failures are logged per
    /// destination and do not fail the caller.
    pub async fn broadcast(&self, event: &TrapEvent) {
        let uptime = self.engine.uptime_ticks();
        for destination in &self.destinations {
            let message = match self.build(destination, event, uptime) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(target: "snmp::trap", destination = %destination.label,
                        error = %e, "failed to build trap");
                    continue;
                }
            };
            match tokio::time::timeout(SEND_TIMEOUT, destination.socket.send(&message)).await {
                Ok(Ok(_)) => {
                    tracing::debug!(target: "snmp::trap", destination = %destination.label,
                        trap = %event.trap_oid, "trap sent");
                }
                Ok(Err(e)) => {
                    tracing::warn!(target: "snmp::trap", destination = %destination.label,
                        error = %e, "trap send failed");
                }
                Err(_) => {
                    tracing::warn!(target: "snmp::trap", destination = %destination.label,
                        "trap send timed out");
                }
            }
        }
    }

    fn build(
        &self,
        destination: &TrapDestination,
        event: &TrapEvent,
        uptime: u32,
    ) -> SnmpResult<Bytes> {
        match destination.version {
            Version::V1 => self.build_v1(destination, event, uptime),
            Version::V2c => Ok(self.build_v2c(destination, event, uptime)),
            Version::V3 => self.build_v3(destination, event, uptime),
        }
    }

    /// The varbinds shared by every trap version: alarm row identity.
    fn alarm_varbinds(event: &TrapEvent) -> Vec<VarBind> {
        vec![
            VarBind::new(event.alarm_id_oid.clone(), Value::Integer(event.index)),
            VarBind::new(
                event.alarm_descr_oid.clone(),
                Value::ObjectIdentifier(event.alarm_oid.clone()),
            ),
        ]
    }

    fn build_v1(
        &self,
        destination: &TrapDestination,
        event: &TrapEvent,
        uptime: u32,
    ) -> SnmpResult<Bytes> {
        let (enterprise, specific) = split_trap_oid(&event.trap_oid)?;
        let trap = TrapV1Pdu {
            enterprise,
            agent_addr: [0, 0, 0, 0],
            generic_trap: GENERIC_ENTERPRISE_SPECIFIC,
            specific_trap: specific,
            time_stamp: uptime,
            varbinds: Self::alarm_varbinds(event),
        };
        Ok(encode_v1_trap(&destination.community, &trap))
    }

    fn trap_v2_pdu(&self, event: &TrapEvent, uptime: u32) -> Pdu {
        let mut varbinds = vec![
            VarBind::new(sys_uptime_oid(), Value::TimeTicks(uptime)),
            VarBind::new(
                snmp_trap_oid(),
                Value::ObjectIdentifier(event.trap_oid.clone()),
            ),
        ];
        varbinds.extend(Self::alarm_varbinds(event));
        Pdu::trap_v2(uptime as i32, varbinds)
    }

    fn build_v2c(&self, destination: &TrapDestination, event: &TrapEvent, uptime: u32) -> Bytes {
        let pdu = self.trap_v2_pdu(event, uptime);
        CommunityMessage::new(
            Version::V2c,
            Bytes::copy_from_slice(&destination.community),
            pdu,
        )
        .encode()
    }

    /// Trap notifications are sent with the agent as the authoritative
    /// engine (RFC 3414 Section 4).
    fn build_v3(
        &self,
        destination: &TrapDestination,
        event: &TrapEvent,
        uptime: u32,
    ) -> SnmpResult<Bytes> {
        let Some((user, keys)) = destination.user.as_ref() else {
            return Err(SnmpError::Auth("v3 trap destination has no user"));
        };

        let security_level = user.security_level();
        let boots = self.engine.boots();
        let time = self.engine.time_secs();
        let pdu = self.trap_v2_pdu(event, uptime);
        let scoped = ScopedPdu::new(
            Bytes::copy_from_slice(self.engine.id()),
            Bytes::new(),
            pdu,
        );
        let global = MsgGlobalData::new(
            uptime as i32,
            65507,
            MsgFlags::new(security_level, false),
        );

        match security_level {
            SecurityLevel::NoAuthNoPriv => {
                let usm = UsmSecurityParams::new(
                    Bytes::copy_from_slice(self.engine.id()),
                    boots,
                    time,
                    user.username.clone(),
                );
                Ok(V3Message::new(global, usm.encode(), scoped).encode())
            }
            SecurityLevel::AuthNoPriv => {
                let auth_key = keys
                    .auth_key
                    .as_ref()
                    .ok_or(SnmpError::Auth("no auth key"))?;
                let usm = UsmSecurityParams::new(
                    Bytes::copy_from_slice(self.engine.id()),
                    boots,
                    time,
                    user.username.clone(),
                )
                .with_auth_placeholder(auth_key.mac_len());

                let mut bytes = V3Message::new(global, usm.encode(), scoped).encode().to_vec();
                let (offset, len) = UsmSecurityParams::find_auth_params_offset(&bytes)
                    .ok_or(SnmpError::Malformed("auth params not found"))?;
                authenticate_message(auth_key, &mut bytes, offset, len);
                Ok(Bytes::from(bytes))
            }
            SecurityLevel::AuthPriv => {
                let auth_key = keys
                    .auth_key
                    .as_ref()
                    .ok_or(SnmpError::Auth("no auth key"))?;
                let priv_key = keys
                    .priv_key
                    .as_ref()
                    .ok_or(SnmpError::Crypto("no privacy key"))?;

                let scoped_bytes = scoped.encode_to_bytes();
                let (ciphertext, priv_params) =
                    priv_key.encrypt(&scoped_bytes, boots, time, self.salt.next())?;

                let usm = UsmSecurityParams::new(
                    Bytes::copy_from_slice(self.engine.id()),
                    boots,
                    time,
                    user.username.clone(),
                )
                .with_auth_placeholder(auth_key.mac_len())
                .with_priv_params(priv_params);

                let mut bytes = V3Message::new_encrypted(global, usm.encode(), ciphertext)
                    .encode()
                    .to_vec();
                let (offset, len) = UsmSecurityParams::find_auth_params_offset(&bytes)
                    .ok_or(SnmpError::Malformed("auth params not found"))?;
                authenticate_message(auth_key, &mut bytes, offset, len);
                Ok(Bytes::from(bytes))
            }
        }
    }
}
