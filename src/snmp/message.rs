//! SNMP message framing for v1/v2c (community) and v3 (RFC 3412).

use bytes::Bytes;

use super::ber::{tag, Decoder, EncodeBuf};
use super::error::{SnmpError, SnmpResult};
use super::pdu::Pdu;

/// SNMP protocol version as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Version {
    V1 = 0,
    V2c = 1,
    V3 = 3,
}

impl Version {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::V1),
            1 => Some(Self::V2c),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Peek the version integer of an encoded message without consuming it.
pub fn peek_version(data: &Bytes) -> SnmpResult<Version> {
    let mut decoder = Decoder::new(data.clone());
    let mut seq = decoder.read_sequence()?;
    let version = seq.read_integer()?;
    Version::from_i32(version).ok_or(SnmpError::Malformed("unknown SNMP version"))
}

/// Community-based message (v1/v2c):
/// `SEQUENCE { version, community OCTET STRING, pdu }`.
#[derive(Debug, Clone)]
pub struct CommunityMessage {
    pub version: Version,
    pub community: Bytes,
    pub pdu: Pdu,
}

impl CommunityMessage {
    pub fn new(version: Version, community: impl Into<Bytes>, pdu: Pdu) -> Self {
        debug_assert!(matches!(version, Version::V1 | Version::V2c));
        Self {
            version,
            community: community.into(),
            pdu,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            self.pdu.encode(buf);
            buf.push_octet_string(&self.community);
            buf.push_integer(self.version.as_i32());
        });
        buf.finish()
    }

    pub fn decode(data: Bytes) -> SnmpResult<Self> {
        let mut decoder = Decoder::new(data);
        let mut seq = decoder.read_sequence()?;

        let version = Version::from_i32(seq.read_integer()?)
            .ok_or(SnmpError::Malformed("unknown SNMP version"))?;
        if version == Version::V3 {
            return Err(SnmpError::Malformed("v3 message in community codec"));
        }
        let community = seq.read_octet_string()?;
        let pdu = Pdu::decode(&mut seq)?;

        Ok(CommunityMessage {
            version,
            community,
            pdu,
        })
    }
}

/// v1 trap message wrapper: same envelope, Trap-PDU body.
pub fn encode_v1_trap(community: &[u8], trap: &super::pdu::TrapV1Pdu) -> Bytes {
    let mut buf = EncodeBuf::new();
    buf.push_sequence(|buf| {
        trap.encode(buf);
        buf.push_octet_string(community);
        buf.push_integer(Version::V1.as_i32());
    });
    buf.finish()
}

/// v3 security level, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl SecurityLevel {
    pub fn requires_auth(self) -> bool {
        matches!(self, Self::AuthNoPriv | Self::AuthPriv)
    }

    pub fn requires_priv(self) -> bool {
        matches!(self, Self::AuthPriv)
    }
}

/// msgFlags (RFC 3412 Section 6.4): authFlag, privFlag, reportableFlag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFlags {
    pub security_level: SecurityLevel,
    pub reportable: bool,
}

impl MsgFlags {
    pub fn new(security_level: SecurityLevel, reportable: bool) -> Self {
        Self {
            security_level,
            reportable,
        }
    }

    pub fn from_byte(byte: u8) -> SnmpResult<Self> {
        let auth = byte & 0x01 != 0;
        let privacy = byte & 0x02 != 0;
        let security_level = match (auth, privacy) {
            (false, false) => SecurityLevel::NoAuthNoPriv,
            (true, false) => SecurityLevel::AuthNoPriv,
            (true, true) => SecurityLevel::AuthPriv,
            // priv without auth is invalid per RFC 3412 Section 7.2 step 5d
            (false, true) => return Err(SnmpError::Malformed("privacy without authentication")),
        };
        Ok(Self {
            security_level,
            reportable: byte & 0x04 != 0,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = match self.security_level {
            SecurityLevel::NoAuthNoPriv => 0x00,
            SecurityLevel::AuthNoPriv => 0x01,
            SecurityLevel::AuthPriv => 0x03,
        };
        if self.reportable {
            flags |= 0x04;
        }
        flags
    }
}

/// msgGlobalData header.
#[derive(Debug, Clone)]
pub struct MsgGlobalData {
    pub msg_id: i32,
    pub msg_max_size: i32,
    pub msg_flags: MsgFlags,
}

/// USM security model identifier (RFC 3411).
const SECURITY_MODEL_USM: i32 = 3;

/// RFC 3412 Section 6.1 lower bound on msgMaxSize.
const MSG_MAX_SIZE_MINIMUM: i32 = 484;

impl MsgGlobalData {
    pub fn new(msg_id: i32, msg_max_size: i32, msg_flags: MsgFlags) -> Self {
        Self {
            msg_id,
            msg_max_size,
            msg_flags,
        }
    }

    pub fn encode(&self, buf: &mut EncodeBuf) {
        buf.push_sequence(|buf| {
            buf.push_integer(SECURITY_MODEL_USM);
            buf.push_octet_string(&[self.msg_flags.to_byte()]);
            buf.push_integer(self.msg_max_size);
            buf.push_integer(self.msg_id);
        });
    }

    pub fn decode(decoder: &mut Decoder) -> SnmpResult<Self> {
        let mut seq = decoder.read_sequence()?;

        let msg_id = seq.read_integer()?;
        let msg_max_size = seq.read_integer()?;
        if msg_max_size < MSG_MAX_SIZE_MINIMUM {
            return Err(SnmpError::Malformed("msgMaxSize below RFC 3412 minimum"));
        }

        let flags_bytes = seq.read_octet_string()?;
        if flags_bytes.len() != 1 {
            return Err(SnmpError::Malformed("msgFlags must be one octet"));
        }
        let msg_flags = MsgFlags::from_byte(flags_bytes[0])?;

        let model = seq.read_integer()?;
        if model != SECURITY_MODEL_USM {
            return Err(SnmpError::Malformed("unknown security model"));
        }

        Ok(Self {
            msg_id,
            msg_max_size,
            msg_flags,
        })
    }
}

/// Scoped PDU: contextEngineID + contextName + PDU.
#[derive(Debug, Clone)]
pub struct ScopedPdu {
    pub context_engine_id: Bytes,
    pub context_name: Bytes,
    pub pdu: Pdu,
}

impl ScopedPdu {
    pub fn new(context_engine_id: impl Into<Bytes>, context_name: impl Into<Bytes>, pdu: Pdu) -> Self {
        Self {
            context_engine_id: context_engine_id.into(),
            context_name: context_name.into(),
            pdu,
        }
    }

    pub fn encode(&self, buf: &mut EncodeBuf) {
        buf.push_sequence(|buf| {
            self.pdu.encode(buf);
            buf.push_octet_string(&self.context_name);
            buf.push_octet_string(&self.context_engine_id);
        });
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = EncodeBuf::new();
        self.encode(&mut buf);
        buf.finish()
    }

    pub fn decode(decoder: &mut Decoder) -> SnmpResult<Self> {
        let mut seq = decoder.read_sequence()?;
        let context_engine_id = seq.read_octet_string()?;
        let context_name = seq.read_octet_string()?;
        let pdu = Pdu::decode(&mut seq)?;
        Ok(Self {
            context_engine_id,
            context_name,
            pdu,
        })
    }
}

/// msgData: plaintext scoped PDU, or the ciphertext octet string for
/// authPriv messages.
#[derive(Debug, Clone)]
pub enum V3MessageData {
    Plaintext(ScopedPdu),
    Encrypted(Bytes),
}

/// SNMPv3 message.
#[derive(Debug, Clone)]
pub struct V3Message {
    pub global_data: MsgGlobalData,
    /// Opaque, USM-encoded security parameters.
    pub security_params: Bytes,
    pub data: V3MessageData,
}

impl V3Message {
    pub fn new(global_data: MsgGlobalData, security_params: Bytes, scoped_pdu: ScopedPdu) -> Self {
        Self {
            global_data,
            security_params,
            data: V3MessageData::Plaintext(scoped_pdu),
        }
    }

    pub fn new_encrypted(
        global_data: MsgGlobalData,
        security_params: Bytes,
        encrypted: Bytes,
    ) -> Self {
        Self {
            global_data,
            security_params,
            data: V3MessageData::Encrypted(encrypted),
        }
    }

    pub fn scoped_pdu(&self) -> Option<&ScopedPdu> {
        match &self.data {
            V3MessageData::Plaintext(sp) => Some(sp),
            V3MessageData::Encrypted(_) => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            match &self.data {
                V3MessageData::Plaintext(scoped) => scoped.encode(buf),
                V3MessageData::Encrypted(ciphertext) => buf.push_octet_string(ciphertext),
            }
            buf.push_octet_string(&self.security_params);
            self.global_data.encode(buf);
            buf.push_integer(Version::V3.as_i32());
        });
        buf.finish()
    }

    pub fn decode(data: Bytes) -> SnmpResult<Self> {
        let mut decoder = Decoder::new(data);
        let mut seq = decoder.read_sequence()?;

        let version = seq.read_integer()?;
        if version != Version::V3.as_i32() {
            return Err(SnmpError::Malformed("not a v3 message"));
        }

        let global_data = MsgGlobalData::decode(&mut seq)?;
        let security_params = seq.read_octet_string()?;

        let data = match seq.peek_tag() {
            Some(tag::universal::OCTET_STRING) => {
                V3MessageData::Encrypted(seq.read_octet_string()?)
            }
            Some(tag::universal::SEQUENCE) => V3MessageData::Plaintext(ScopedPdu::decode(&mut seq)?),
            _ => return Err(SnmpError::Malformed("bad msgData")),
        };

        Ok(Self {
            global_data,
            security_params,
            data,
        })
    }
}
