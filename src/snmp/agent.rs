//! SNMP agent: UDP server, community-scoped binding sets, request dispatch.
//!
//! The master agent owns two binding sets keyed by community: the public
//! (read) community serves every enabled scalar and all dynamic table rows,
//! the private (write) community serves write bindings for writable scalars.
//! When the two community names collapse, a single set carries read and
//! write on the same OIDs. Configuring any USM user switches the agent to
//! v3-only: community requests are dropped.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use subtle::ConstantTimeEq;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::ber::Decoder;
use super::error::{ErrorStatus, SnmpResult};
use super::message::{
    peek_version, CommunityMessage, MsgFlags, MsgGlobalData, ScopedPdu, SecurityLevel, V3Message,
    V3MessageData, Version,
};
use super::pdu::{Pdu, PduType};
use super::usm::{
    authenticate_message, verify_message, DerivedKeys, SaltCounter, UsmSecurityParams, UsmUser,
};
use super::value::{Value, VarBind};
use crate::oid;
use crate::snmp::oid::Oid;

/// Engine identity shared by the agent and the trap emitter. `start` doubles
/// as the process epoch for every TimeTicks value the agent reports.
pub struct Engine {
    id: Vec<u8>,
    boots: u32,
    start: Instant,
}

impl Engine {
    pub fn new() -> Self {
        // RFC 3411 local format: 0x80 + enterprise marker + boot timestamp
        let mut id = vec![0x80, 0x00, 0x00, 0x00, 0x01];
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        id.extend_from_slice(&stamp.to_be_bytes());
        Self {
            id,
            boots: 1,
            start: Instant::now(),
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn boots(&self) -> u32 {
        self.boots
    }

    /// Seconds since engine start, the USM engine-time.
    pub fn time_secs(&self) -> u32 {
        self.start.elapsed().as_secs() as u32
    }

    /// Centiseconds since start: the agent's sysUpTime / upsAlarmTime epoch.
    pub fn uptime_ticks(&self) -> u32 {
        (self.start.elapsed().as_millis() / 10) as u32
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Which community-keyed binding set a request is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunityRole {
    Public,
    Private,
}

/// One registered OID.
#[derive(Debug, Clone)]
pub struct Binding<S> {
    pub source: S,
    pub readable: bool,
    pub writable: bool,
}

/// Sorted OID → binding map for one sub-agent.
#[derive(Debug, Clone)]
pub struct BindingSet<S> {
    map: BTreeMap<Oid, Binding<S>>,
}

impl<S> BindingSet<S> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, oid: Oid, binding: Binding<S>) {
        self.map.insert(oid, binding);
    }

    pub fn get(&self, oid: &Oid) -> Option<&Binding<S>> {
        self.map.get(oid)
    }

    /// Remove every binding under `prefix`; used to tear down table rows.
    pub fn remove_prefix(&mut self, prefix: &Oid) {
        self.map.retain(|oid, _| !oid.starts_with(prefix));
    }

    /// First readable binding strictly after `oid`.
    pub fn next_readable(&self, oid: &Oid) -> Option<(&Oid, &Binding<S>)> {
        self.map
            .range((Bound::Excluded(oid.clone()), Bound::Unbounded))
            .find(|(_, b)| b.readable)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Oid, &Binding<S>)> {
        self.map.iter()
    }

    /// Count bindings under `prefix`.
    pub fn count_prefix(&self, prefix: &Oid) -> usize {
        self.map.keys().filter(|oid| oid.starts_with(prefix)).count()
    }
}

impl<S> Default for BindingSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// The live state an agent serves: binding sets plus value resolution.
///
/// Implemented by the application snapshot; the agent holds it behind one
/// coarse mutex shared with the serial receive path, so a Set committed here
/// is visible to the next Get and alarm-table rebuilds are atomic with
/// respect to requests.
pub trait ValueStore: Send + 'static {
    type Source: Clone + Send;

    fn bindings(&self, role: CommunityRole) -> &BindingSet<Self::Source>;

    /// Current value behind a binding, or `None` when the row vanished.
    fn load(&self, source: &Self::Source) -> Option<Value>;

    /// Write a value through a binding and run the profile set hook.
    fn store(&mut self, source: &Self::Source, value: &Value) -> Result<(), ErrorStatus>;
}

/// Agent configuration handed over by `main`.
pub struct AgentConfig {
    pub public_community: Vec<u8>,
    pub private_community: Vec<u8>,
    pub users: Vec<UsmUser>,
}

/// SNMP master agent.
pub struct Agent<T: ValueStore> {
    socket: UdpSocket,
    store: Arc<Mutex<T>>,
    engine: Arc<Engine>,
    public_community: Vec<u8>,
    private_community: Vec<u8>,
    /// Keys are derived once: the authoritative engine ID never changes.
    users: HashMap<Bytes, DerivedKeys>,
    salt: SaltCounter,
    cancel: CancellationToken,
}

/// Bind a UDP socket with address reuse so quick agent restarts do not trip
/// over lingering sockets.
pub async fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

impl<T: ValueStore> Agent<T> {
    pub fn new(
        socket: UdpSocket,
        store: Arc<Mutex<T>>,
        engine: Arc<Engine>,
        config: AgentConfig,
        cancel: CancellationToken,
    ) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| (user.username.clone(), user.derive_keys(engine.id())))
            .collect();
        Self {
            socket,
            store,
            engine,
            public_community: config.public_community,
            private_community: config.private_community,
            users,
            salt: SaltCounter::new(),
            cancel,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn v3_only(&self) -> bool {
        !self.users.is_empty()
    }

    fn communities_collapsed(&self) -> bool {
        self.public_community == self.private_community
    }

    /// Serve requests until cancelled.
    pub async fn run(&self) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, source) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(target: "snmp::agent", error = %e, "recv_from failed");
                        continue;
                    }
                },
                _ = self.cancel.cancelled() => {
                    tracing::info!(target: "snmp::agent", "agent shutdown requested");
                    return;
                }
            };

            let data = Bytes::copy_from_slice(&buf[..len]);
            match self.handle_datagram(data, source) {
                Ok(Some(reply)) => {
                    if let Err(e) = self.socket.send_to(&reply, source).await {
                        tracing::warn!(target: "snmp::agent", source = %source, error = %e,
                            "failed to send response");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(target: "snmp::agent", source = %source, error = %e,
                        "dropping malformed request");
                }
            }
        }
    }

    /// Process one datagram; `Some` is the encoded reply. Public so tests can
    /// drive the agent without sockets.
    pub fn handle_datagram(&self, data: Bytes, source: SocketAddr) -> SnmpResult<Option<Bytes>> {
        let version = peek_version(&data)?;

        match version {
            Version::V1 | Version::V2c => {
                if self.v3_only() {
                    tracing::debug!(target: "snmp::agent", source = %source,
                        "community request rejected: v3-only mode");
                    return Ok(None);
                }
                self.handle_community(data, source, version)
            }
            Version::V3 => self.handle_v3(data, source),
        }
    }

    fn community_role(&self, community: &[u8]) -> Option<CommunityRole> {
        // Constant-time comparison; both communities are always checked.
        let is_public = community.len() == self.public_community.len()
            && bool::from(self.public_community.as_slice().ct_eq(community));
        let is_private = community.len() == self.private_community.len()
            && bool::from(self.private_community.as_slice().ct_eq(community));
        if is_public {
            Some(CommunityRole::Public)
        } else if is_private {
            Some(CommunityRole::Private)
        } else {
            None
        }
    }

    fn handle_community(
        &self,
        data: Bytes,
        source: SocketAddr,
        version: Version,
    ) -> SnmpResult<Option<Bytes>> {
        let msg = CommunityMessage::decode(data)?;

        let Some(role) = self.community_role(&msg.community) else {
            tracing::debug!(target: "snmp::agent", source = %source, "invalid community");
            return Ok(None);
        };

        if !msg.pdu.pdu_type.is_request() {
            return Ok(None);
        }

        let response = self.dispatch(role, &msg.pdu, version);
        let reply = CommunityMessage::new(version, msg.community, response);
        Ok(Some(reply.encode()))
    }

    /// Dispatch one request PDU against the binding set a community selects.
    fn dispatch(&self, role: CommunityRole, pdu: &Pdu, version: Version) -> Pdu {
        match pdu.pdu_type {
            PduType::GetRequest => self.handle_get(role, pdu, version),
            PduType::GetNextRequest => self.handle_get_next(role, pdu, version),
            PduType::GetBulkRequest => self.handle_get_bulk(role, pdu),
            PduType::SetRequest => self.handle_set(role, pdu, version),
            _ => pdu.error_response(ErrorStatus::GenErr, 0),
        }
    }

    fn handle_get(&self, role: CommunityRole, pdu: &Pdu, version: Version) -> Pdu {
        let store = self.store.lock().expect("state mutex poisoned");
        let set = store.bindings(role);

        let mut response = Vec::with_capacity(pdu.varbinds.len());
        for (index, vb) in pdu.varbinds.iter().enumerate() {
            let value = set
                .get(&vb.oid)
                .filter(|b| b.readable)
                .and_then(|b| store.load(&b.source));

            match value {
                Some(value) => response.push(VarBind::new(vb.oid.clone(), value)),
                None => {
                    if version == Version::V1 {
                        return pdu.error_response(ErrorStatus::NoSuchName, (index + 1) as i32);
                    }
                    response.push(VarBind::new(vb.oid.clone(), Value::NoSuchObject));
                }
            }
        }

        pdu.response(response)
    }

    fn handle_get_next(&self, role: CommunityRole, pdu: &Pdu, version: Version) -> Pdu {
        let store = self.store.lock().expect("state mutex poisoned");
        let set = store.bindings(role);

        let mut response = Vec::with_capacity(pdu.varbinds.len());
        for (index, vb) in pdu.varbinds.iter().enumerate() {
            let next = set
                .next_readable(&vb.oid)
                .and_then(|(oid, b)| store.load(&b.source).map(|v| (oid.clone(), v)));

            match next {
                Some((oid, value)) => response.push(VarBind::new(oid, value)),
                None => {
                    if version == Version::V1 {
                        return pdu.error_response(ErrorStatus::NoSuchName, (index + 1) as i32);
                    }
                    response.push(VarBind::new(vb.oid.clone(), Value::EndOfMibView));
                }
            }
        }

        pdu.response(response)
    }

    /// GETBULK as iterated GETNEXT (RFC 3416 Section 4.2.3); no response
    /// packing beyond the datagram limit.
    fn handle_get_bulk(&self, role: CommunityRole, pdu: &Pdu) -> Pdu {
        let non_repeaters = pdu.error_status.max(0) as usize;
        let max_repetitions = (pdu.error_index.max(0) as usize).min(256);

        let store = self.store.lock().expect("state mutex poisoned");
        let set = store.bindings(role);

        let mut response = Vec::new();

        for vb in pdu.varbinds.iter().take(non_repeaters) {
            match set
                .next_readable(&vb.oid)
                .and_then(|(oid, b)| store.load(&b.source).map(|v| (oid.clone(), v)))
            {
                Some((oid, value)) => response.push(VarBind::new(oid, value)),
                None => response.push(VarBind::new(vb.oid.clone(), Value::EndOfMibView)),
            }
        }

        let repeaters: Vec<Oid> = pdu
            .varbinds
            .iter()
            .skip(non_repeaters)
            .map(|vb| vb.oid.clone())
            .collect();
        let mut cursors = repeaters;
        let mut done = vec![false; cursors.len()];

        for _ in 0..max_repetitions {
            if done.iter().all(|&d| d) {
                break;
            }
            for (i, cursor) in cursors.iter_mut().enumerate() {
                if done[i] {
                    response.push(VarBind::new(cursor.clone(), Value::EndOfMibView));
                    continue;
                }
                match set
                    .next_readable(cursor)
                    .and_then(|(oid, b)| store.load(&b.source).map(|v| (oid.clone(), v)))
                {
                    Some((oid, value)) => {
                        *cursor = oid.clone();
                        response.push(VarBind::new(oid, value));
                    }
                    None => {
                        done[i] = true;
                        response.push(VarBind::new(cursor.clone(), Value::EndOfMibView));
                    }
                }
            }
        }

        pdu.response(response)
    }

    fn handle_set(&self, role: CommunityRole, pdu: &Pdu, version: Version) -> Pdu {
        let mut store = self.store.lock().expect("state mutex poisoned");

        // validate every binding before mutating anything (RFC 3416 as-if-
        // simultaneous semantics for the single-varbind requests we see)
        for (index, vb) in pdu.varbinds.iter().enumerate() {
            let binding = store.bindings(role).get(&vb.oid);
            let writable = binding.map(|b| b.writable).unwrap_or(false);
            if !writable {
                let status = if version == Version::V1 {
                    ErrorStatus::NoSuchName
                } else {
                    ErrorStatus::NotWritable
                };
                return pdu.error_response(status, (index + 1) as i32);
            }
        }

        for (index, vb) in pdu.varbinds.iter().enumerate() {
            let source = store
                .bindings(role)
                .get(&vb.oid)
                .map(|b| b.source.clone())
                .expect("validated above");
            if let Err(status) = store.store(&source, &vb.value) {
                return pdu.error_response(status, (index + 1) as i32);
            }
        }

        pdu.response(pdu.varbinds.clone())
    }

    // ---- SNMPv3 ----

    fn handle_v3(&self, data: Bytes, source: SocketAddr) -> SnmpResult<Option<Bytes>> {
        let msg = V3Message::decode(data.clone())?;
        let security_level = msg.global_data.msg_flags.security_level;
        let usm = UsmSecurityParams::decode(msg.security_params.clone())?;

        // Discovery: empty engine ID
        if usm.engine_id.is_empty() {
            return Ok(self.v3_report(&msg, &usm, oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 4, 0)));
        }

        if usm.engine_id.as_ref() != self.engine.id() {
            tracing::debug!(target: "snmp::agent", source = %source, "engine ID mismatch");
            return Ok(self.v3_report(&msg, &usm, oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 4, 0)));
        }

        let Some(keys) = self.users.get(&usm.username) else {
            tracing::debug!(target: "snmp::agent", source = %source,
                username = %String::from_utf8_lossy(&usm.username), "unknown USM user");
            return Ok(self.v3_report(&msg, &usm, oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 3, 0)));
        };

        if security_level.requires_auth() {
            let Some(auth_key) = keys.auth_key.as_ref() else {
                // usmStatsUnsupportedSecLevels
                return Ok(self.v3_report(&msg, &usm, oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 1, 0)));
            };
            let Some((offset, len)) = UsmSecurityParams::find_auth_params_offset(&data) else {
                return Err(super::error::SnmpError::Auth("auth params not found"));
            };
            if !verify_message(auth_key, &data, offset, len) {
                tracing::debug!(target: "snmp::agent", source = %source, "HMAC verification failed");
                return Ok(self.v3_report(&msg, &usm, oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 5, 0)));
            }

            // RFC 3414 Section 2.2.3 time window
            let our_time = self.engine.time_secs() as i64;
            if (i64::from(usm.engine_time) - our_time).abs() > 150
                || usm.engine_boots != self.engine.boots()
            {
                tracing::debug!(target: "snmp::agent", source = %source, "outside time window");
                return Ok(self.v3_report(&msg, &usm, oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 2, 0)));
            }
        }

        let scoped = if security_level.requires_priv() {
            let Some(priv_key) = keys.priv_key.as_ref() else {
                return Err(super::error::SnmpError::Crypto("user has no privacy key"));
            };
            let V3MessageData::Encrypted(ciphertext) = &msg.data else {
                return Err(super::error::SnmpError::Malformed("expected encrypted PDU"));
            };
            let plaintext =
                priv_key.decrypt(ciphertext, usm.engine_boots, usm.engine_time, &usm.priv_params)?;
            ScopedPdu::decode(&mut Decoder::new(plaintext))?
        } else {
            match msg.scoped_pdu() {
                Some(sp) => sp.clone(),
                None => {
                    return Err(super::error::SnmpError::Malformed("unexpected encryption"));
                }
            }
        };

        if !scoped.pdu.pdu_type.is_request() {
            return Ok(None);
        }

        // Authenticated v3 users read from the public set and write through
        // the write set.
        let role = if scoped.pdu.pdu_type == PduType::SetRequest {
            if self.communities_collapsed() {
                CommunityRole::Public
            } else {
                CommunityRole::Private
            }
        } else {
            CommunityRole::Public
        };
        let response_pdu = self.dispatch(role, &scoped.pdu, Version::V3);

        self.build_v3_response(&msg, &usm, response_pdu, scoped, keys)
            .map(Some)
    }

    /// Report PDU (usmStats*) for discovery and security failures, honoring
    /// the reportable flag (RFC 3412 Section 7.1 step 3).
    fn v3_report(
        &self,
        incoming: &V3Message,
        incoming_usm: &UsmSecurityParams,
        report_oid: Oid,
    ) -> Option<Bytes> {
        if !incoming.global_data.msg_flags.reportable {
            return None;
        }

        let report_pdu = Pdu {
            pdu_type: PduType::Report,
            request_id: incoming.global_data.msg_id,
            error_status: 0,
            error_index: 0,
            varbinds: vec![VarBind::new(report_oid, Value::Counter32(0))],
        };

        let global = MsgGlobalData::new(
            incoming.global_data.msg_id,
            incoming.global_data.msg_max_size,
            MsgFlags::new(SecurityLevel::NoAuthNoPriv, false),
        );
        let usm = UsmSecurityParams::new(
            Bytes::copy_from_slice(self.engine.id()),
            self.engine.boots(),
            self.engine.time_secs(),
            incoming_usm.username.clone(),
        );
        let scoped = ScopedPdu::new(
            Bytes::copy_from_slice(self.engine.id()),
            Bytes::new(),
            report_pdu,
        );

        Some(V3Message::new(global, usm.encode(), scoped).encode())
    }

    fn build_v3_response(
        &self,
        incoming: &V3Message,
        incoming_usm: &UsmSecurityParams,
        response_pdu: Pdu,
        request_scoped: ScopedPdu,
        keys: &DerivedKeys,
    ) -> SnmpResult<Bytes> {
        let security_level = incoming.global_data.msg_flags.security_level;
        let boots = self.engine.boots();
        let time = self.engine.time_secs();

        let global = MsgGlobalData::new(
            incoming.global_data.msg_id,
            incoming.global_data.msg_max_size,
            MsgFlags::new(security_level, false),
        );
        let scoped = ScopedPdu::new(
            request_scoped.context_engine_id,
            request_scoped.context_name,
            response_pdu,
        );

        match security_level {
            SecurityLevel::NoAuthNoPriv => {
                let usm = UsmSecurityParams::new(
                    Bytes::copy_from_slice(self.engine.id()),
                    boots,
                    time,
                    incoming_usm.username.clone(),
                );
                Ok(V3Message::new(global, usm.encode(), scoped).encode())
            }
            SecurityLevel::AuthNoPriv => {
                let auth_key = keys
                    .auth_key
                    .as_ref()
                    .ok_or(super::error::SnmpError::Auth("no auth key for response"))?;
                let usm = UsmSecurityParams::new(
                    Bytes::copy_from_slice(self.engine.id()),
                    boots,
                    time,
                    incoming_usm.username.clone(),
                )
                .with_auth_placeholder(auth_key.mac_len());

                let mut bytes = V3Message::new(global, usm.encode(), scoped).encode().to_vec();
                let (offset, len) = UsmSecurityParams::find_auth_params_offset(&bytes)
                    .ok_or(super::error::SnmpError::Malformed("auth params not found"))?;
                authenticate_message(auth_key, &mut bytes, offset, len);
                Ok(Bytes::from(bytes))
            }
            SecurityLevel::AuthPriv => {
                let auth_key = keys
                    .auth_key
                    .as_ref()
                    .ok_or(super::error::SnmpError::Auth("no auth key for response"))?;
                let priv_key = keys
                    .priv_key
                    .as_ref()
                    .ok_or(super::error::SnmpError::Crypto("no privacy key for response"))?;

                let scoped_bytes = scoped.encode_to_bytes();
                let (ciphertext, priv_params) =
                    priv_key.encrypt(&scoped_bytes, boots, time, self.salt.next())?;

                let usm = UsmSecurityParams::new(
                    Bytes::copy_from_slice(self.engine.id()),
                    boots,
                    time,
                    incoming_usm.username.clone(),
                )
                .with_auth_placeholder(auth_key.mac_len())
                .with_priv_params(priv_params);

                let mut bytes = V3Message::new_encrypted(global, usm.encode(), ciphertext)
                    .encode()
                    .to_vec();
                let (offset, len) = UsmSecurityParams::find_auth_params_offset(&bytes)
                    .ok_or(super::error::SnmpError::Malformed("auth params not found"))?;
                authenticate_message(auth_key, &mut bytes, offset, len);
                Ok(Bytes::from(bytes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal store: two scalars (one writable) and one two-row table
    /// column, registered the way the application does it.
    struct TestStore {
        public: BindingSet<u32>,
        private: BindingSet<u32>,
        values: HashMap<u32, Value>,
    }

    const RO_SCALAR: u32 = 1;
    const RW_SCALAR: u32 = 2;
    const ROW_1: u32 = 10;
    const ROW_2: u32 = 11;

    fn ro_oid() -> Oid {
        oid!(1, 3, 6, 1, 2, 1, 33, 1, 2, 1, 0)
    }
    fn rw_oid() -> Oid {
        oid!(1, 3, 6, 1, 2, 1, 33, 1, 9, 8, 0)
    }
    fn row_base() -> Oid {
        oid!(1, 3, 6, 1, 2, 1, 33, 1, 6, 2, 1, 1)
    }

    impl TestStore {
        fn new(collapsed: bool) -> Self {
            let mut public = BindingSet::new();
            let mut private = BindingSet::new();

            public.insert(
                ro_oid(),
                Binding {
                    source: RO_SCALAR,
                    readable: true,
                    writable: false,
                },
            );
            public.insert(
                rw_oid(),
                Binding {
                    source: RW_SCALAR,
                    readable: true,
                    writable: collapsed,
                },
            );
            public.insert(
                row_base().child(1),
                Binding {
                    source: ROW_1,
                    readable: true,
                    writable: false,
                },
            );
            public.insert(
                row_base().child(2),
                Binding {
                    source: ROW_2,
                    readable: true,
                    writable: false,
                },
            );
            if !collapsed {
                private.insert(
                    rw_oid(),
                    Binding {
                        source: RW_SCALAR,
                        readable: false,
                        writable: true,
                    },
                );
            }

            let mut values = HashMap::new();
            values.insert(RO_SCALAR, Value::Integer(2));
            values.insert(RW_SCALAR, Value::Integer(3));
            values.insert(ROW_1, Value::Integer(0));
            values.insert(ROW_2, Value::Integer(1));

            Self {
                public,
                private,
                values,
            }
        }
    }

    impl ValueStore for TestStore {
        type Source = u32;

        fn bindings(&self, role: CommunityRole) -> &BindingSet<u32> {
            match role {
                CommunityRole::Public => &self.public,
                CommunityRole::Private => &self.private,
            }
        }

        fn load(&self, source: &u32) -> Option<Value> {
            self.values.get(source).cloned()
        }

        fn store(&mut self, source: &u32, value: &Value) -> Result<(), ErrorStatus> {
            match value {
                Value::Integer(_) => {
                    self.values.insert(*source, value.clone());
                    Ok(())
                }
                _ => Err(ErrorStatus::WrongType),
            }
        }
    }

    async fn agent(collapsed: bool) -> Agent<TestStore> {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (public, private) = if collapsed {
            (b"public".to_vec(), b"public".to_vec())
        } else {
            (b"public".to_vec(), b"private".to_vec())
        };
        Agent::new(
            socket,
            Arc::new(Mutex::new(TestStore::new(collapsed))),
            Arc::new(Engine::new()),
            AgentConfig {
                public_community: public,
                private_community: private,
                users: vec![],
            },
            CancellationToken::new(),
        )
    }

    fn src() -> SocketAddr {
        "127.0.0.1:39000".parse().unwrap()
    }

    fn request(pdu_type: PduType, community: &[u8], varbinds: Vec<VarBind>) -> Bytes {
        let pdu = Pdu {
            pdu_type,
            request_id: 99,
            error_status: 0,
            error_index: 0,
            varbinds,
        };
        CommunityMessage::new(Version::V2c, Bytes::copy_from_slice(community), pdu).encode()
    }

    fn decode_reply(reply: Bytes) -> Pdu {
        CommunityMessage::decode(reply).unwrap().pdu
    }

    #[tokio::test]
    async fn get_scalar() {
        let agent = agent(false).await;
        let req = request(PduType::GetRequest, b"public", vec![VarBind::null(ro_oid())]);
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.error_status, 0);
        assert_eq!(reply.varbinds[0].value, Value::Integer(2));
    }

    #[tokio::test]
    async fn get_unknown_oid_is_no_such_object() {
        let agent = agent(false).await;
        let req = request(
            PduType::GetRequest,
            b"public",
            vec![VarBind::null(oid!(1, 3, 6, 1, 2, 1, 1, 1, 0))],
        );
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.varbinds[0].value, Value::NoSuchObject);
    }

    #[tokio::test]
    async fn bad_community_is_dropped() {
        let agent = agent(false).await;
        let req = request(PduType::GetRequest, b"wrong", vec![VarBind::null(ro_oid())]);
        assert!(agent.handle_datagram(req, src()).unwrap().is_none());
    }

    #[tokio::test]
    async fn walk_visits_scalars_and_rows_in_order() {
        let agent = agent(false).await;
        let mut cursor = oid!(1, 3, 6, 1, 2, 1, 33);
        let mut seen = Vec::new();
        loop {
            let req = request(
                PduType::GetNextRequest,
                b"public",
                vec![VarBind::null(cursor.clone())],
            );
            let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
            let vb = &reply.varbinds[0];
            if vb.value == Value::EndOfMibView {
                break;
            }
            cursor = vb.oid.clone();
            seen.push(vb.oid.clone());
        }
        assert_eq!(
            seen,
            vec![
                ro_oid(),
                row_base().child(1),
                row_base().child(2),
                rw_oid(),
            ]
        );
    }

    #[tokio::test]
    async fn set_against_public_rejected_when_communities_differ() {
        let agent = agent(false).await;
        let req = request(
            PduType::SetRequest,
            b"public",
            vec![VarBind::new(rw_oid(), Value::Integer(2))],
        );
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.error_status, ErrorStatus::NotWritable.as_i32());
    }

    #[tokio::test]
    async fn set_against_private_succeeds_and_is_visible() {
        let agent = agent(false).await;
        let req = request(
            PduType::SetRequest,
            b"private",
            vec![VarBind::new(rw_oid(), Value::Integer(2))],
        );
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.error_status, 0);

        let req = request(PduType::GetRequest, b"public", vec![VarBind::null(rw_oid())]);
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.varbinds[0].value, Value::Integer(2));
    }

    #[tokio::test]
    async fn set_succeeds_with_public_when_communities_collapse() {
        let agent = agent(true).await;
        let req = request(
            PduType::SetRequest,
            b"public",
            vec![VarBind::new(rw_oid(), Value::Integer(2))],
        );
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.error_status, 0);
    }

    #[tokio::test]
    async fn set_wrong_type_surfaces_error() {
        let agent = agent(false).await;
        let req = request(
            PduType::SetRequest,
            b"private",
            vec![VarBind::new(rw_oid(), Value::string("nope"))],
        );
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.error_status, ErrorStatus::WrongType.as_i32());
    }

    #[tokio::test]
    async fn getbulk_walks_rows() {
        let agent = agent(false).await;
        let req = {
            let pdu = Pdu {
                pdu_type: PduType::GetBulkRequest,
                request_id: 5,
                error_status: 0,  // non-repeaters
                error_index: 10,  // max-repetitions
                varbinds: vec![VarBind::null(row_base())],
            };
            CommunityMessage::new(Version::V2c, Bytes::from_static(b"public"), pdu).encode()
        };
        let reply = decode_reply(agent.handle_datagram(req, src()).unwrap().unwrap());
        assert_eq!(reply.varbinds[0].oid, row_base().child(1));
        assert_eq!(reply.varbinds[1].oid, row_base().child(2));
        // walk leaves the table, then hits the end of the view
        assert!(reply
            .varbinds
            .iter()
            .any(|vb| vb.value == Value::EndOfMibView));
    }

    #[tokio::test]
    async fn v3_only_mode_drops_community_requests() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let agent = Agent::new(
            socket,
            Arc::new(Mutex::new(TestStore::new(false))),
            Arc::new(Engine::new()),
            AgentConfig {
                public_community: b"public".to_vec(),
                private_community: b"private".to_vec(),
                users: vec![UsmUser {
                    username: Bytes::from_static(b"operator"),
                    auth: Some((
                        crate::snmp::usm::AuthProtocol::Sha256,
                        b"authpass".to_vec(),
                    )),
                    privacy: None,
                }],
            },
            CancellationToken::new(),
        );

        let req = request(PduType::GetRequest, b"public", vec![VarBind::null(ro_oid())]);
        assert!(agent.handle_datagram(req, src()).unwrap().is_none());
    }

    #[tokio::test]
    async fn v3_discovery_gets_report() {
        let agent = agent(false).await;
        let usm = UsmSecurityParams::new(Bytes::new(), 0, 0, Bytes::new());
        let scoped = ScopedPdu::new(
            Bytes::new(),
            Bytes::new(),
            Pdu {
                pdu_type: PduType::GetRequest,
                request_id: 1,
                error_status: 0,
                error_index: 0,
                varbinds: vec![],
            },
        );
        let msg = V3Message::new(
            MsgGlobalData::new(100, 65507, MsgFlags::new(SecurityLevel::NoAuthNoPriv, true)),
            usm.encode(),
            scoped,
        );

        let reply = agent.handle_datagram(msg.encode(), src()).unwrap().unwrap();
        let decoded = V3Message::decode(reply).unwrap();
        assert_eq!(decoded.global_data.msg_id, 100);
        let report = decoded.scoped_pdu().unwrap();
        assert_eq!(report.pdu.pdu_type, PduType::Report);
        // usmStatsUnknownEngineIDs
        assert_eq!(
            report.pdu.varbinds[0].oid,
            oid!(1, 3, 6, 1, 6, 3, 15, 1, 1, 4, 0)
        );
    }

    #[test]
    fn binding_set_prefix_removal() {
        let mut set: BindingSet<u32> = BindingSet::new();
        for i in 1..=3 {
            set.insert(
                row_base().child(i),
                Binding {
                    source: i,
                    readable: true,
                    writable: false,
                },
            );
        }
        set.insert(
            ro_oid(),
            Binding {
                source: 9,
                readable: true,
                writable: false,
            },
        );
        assert_eq!(set.count_prefix(&row_base()), 3);
        set.remove_prefix(&row_base());
        assert_eq!(set.count_prefix(&row_base()), 0);
        assert!(set.get(&ro_oid()).is_some());
    }
}
