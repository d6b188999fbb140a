//! BER encoding and decoding.
//!
//! Decoding is zero-copy over [`Bytes`]. Encoding uses a reverse-filling
//! buffer: content is pushed back-to-front so every length is known by the
//! time it is written, and [`EncodeBuf::finish`] reverses once.

use bytes::Bytes;

use super::error::{SnmpError, SnmpResult};
use super::oid::Oid;

/// Maximum accepted length field. SNMP messages are at most a few KB; this
/// caps hostile length fields long before allocation.
pub const MAX_LENGTH: usize = 0x20000; // 128 KiB

/// BER tag constants.
pub mod tag {
    /// X.690 universal class.
    pub mod universal {
        pub const INTEGER: u8 = 0x02;
        pub const OCTET_STRING: u8 = 0x04;
        pub const NULL: u8 = 0x05;
        pub const OBJECT_IDENTIFIER: u8 = 0x06;
        pub const SEQUENCE: u8 = 0x30;
    }

    /// SNMP application class (RFC 2578).
    pub mod application {
        pub const IP_ADDRESS: u8 = 0x40;
        pub const COUNTER32: u8 = 0x41;
        pub const GAUGE32: u8 = 0x42;
        pub const TIMETICKS: u8 = 0x43;
        pub const OPAQUE: u8 = 0x44;
        pub const COUNTER64: u8 = 0x46;
    }

    /// Context class exception values (RFC 3416).
    pub mod context {
        pub const NO_SUCH_OBJECT: u8 = 0x80;
        pub const NO_SUCH_INSTANCE: u8 = 0x81;
        pub const END_OF_MIB_VIEW: u8 = 0x82;
    }

    /// PDU tags (RFC 3416 Section 3).
    pub mod pdu {
        pub const GET_REQUEST: u8 = 0xA0;
        pub const GET_NEXT_REQUEST: u8 = 0xA1;
        pub const RESPONSE: u8 = 0xA2;
        pub const SET_REQUEST: u8 = 0xA3;
        pub const TRAP_V1: u8 = 0xA4;
        pub const GET_BULK_REQUEST: u8 = 0xA5;
        pub const INFORM_REQUEST: u8 = 0xA6;
        pub const TRAP_V2: u8 = 0xA7;
        pub const REPORT: u8 = 0xA8;
    }
}

/// Encode a length, returning bytes in reverse order for prepending.
///
/// Short form for lengths <= 127, long form otherwise (X.690 Section 8.1.3).
pub fn encode_length(len: usize) -> ([u8; 5], usize) {
    let mut buf = [0u8; 5];
    if len <= 127 {
        buf[0] = len as u8;
        (buf, 1)
    } else if len <= 0xFF {
        buf[0] = len as u8;
        buf[1] = 0x81;
        (buf, 2)
    } else if len <= 0xFFFF {
        buf[0] = len as u8;
        buf[1] = (len >> 8) as u8;
        buf[2] = 0x82;
        (buf, 3)
    } else if len <= 0xFF_FFFF {
        buf[0] = len as u8;
        buf[1] = (len >> 8) as u8;
        buf[2] = (len >> 16) as u8;
        buf[3] = 0x83;
        (buf, 4)
    } else {
        buf[0] = len as u8;
        buf[1] = (len >> 8) as u8;
        buf[2] = (len >> 16) as u8;
        buf[3] = (len >> 24) as u8;
        buf[4] = 0x84;
        (buf, 5)
    }
}

/// Decode a length, returning (length, bytes consumed). The indefinite form
/// (0x80) is rejected, matching net-snmp.
pub fn decode_length(data: &[u8]) -> SnmpResult<(usize, usize)> {
    let first = *data
        .first()
        .ok_or(SnmpError::Malformed("truncated length"))?;

    if first == 0x80 {
        return Err(SnmpError::Malformed("indefinite length"));
    }
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }

    let num_octets = (first & 0x7F) as usize;
    if num_octets == 0 || num_octets > 4 {
        return Err(SnmpError::Malformed("invalid long-form length"));
    }
    if data.len() < 1 + num_octets {
        return Err(SnmpError::Malformed("truncated length"));
    }
    let mut len = 0usize;
    for &b in &data[1..1 + num_octets] {
        len = (len << 8) | b as usize;
    }
    if len > MAX_LENGTH {
        return Err(SnmpError::Malformed("length exceeds maximum"));
    }
    Ok((len, 1 + num_octets))
}

/// BER decoder over a byte buffer.
pub struct Decoder {
    data: Bytes,
    offset: usize,
}

impl Decoder {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.offset).copied()
    }

    pub fn read_tag(&mut self) -> SnmpResult<u8> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or(SnmpError::Malformed("truncated data"))?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_length(&mut self) -> SnmpResult<usize> {
        let (len, consumed) = decode_length(&self.data[self.offset..])?;
        self.offset += consumed;
        Ok(len)
    }

    pub fn read_bytes(&mut self, len: usize) -> SnmpResult<Bytes> {
        if self.offset.saturating_add(len) > self.data.len() {
            return Err(SnmpError::Malformed("truncated data"));
        }
        let bytes = self.data.slice(self.offset..self.offset + len);
        self.offset += len;
        Ok(bytes)
    }

    /// Read and require a specific tag, returning the content length.
    pub fn expect_tag(&mut self, expected: u8) -> SnmpResult<usize> {
        let tag = self.read_tag()?;
        if tag != expected {
            return Err(SnmpError::Malformed("unexpected tag"));
        }
        self.read_length()
    }

    pub fn read_integer(&mut self) -> SnmpResult<i32> {
        let len = self.expect_tag(tag::universal::INTEGER)?;
        self.read_integer_value(len)
    }

    /// Sign-extended INTEGER content. Oversized encodings are truncated to
    /// 32 bits, matching net-snmp's permissive parsing.
    pub fn read_integer_value(&mut self, len: usize) -> SnmpResult<i32> {
        if len == 0 {
            return Err(SnmpError::Malformed("zero-length integer"));
        }
        let bytes = self.read_bytes(len)?;
        let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for &byte in bytes.iter().take(4) {
            value = (value << 8) | i32::from(byte);
        }
        Ok(value)
    }

    pub fn read_unsigned32(&mut self, expected_tag: u8) -> SnmpResult<u32> {
        let len = self.expect_tag(expected_tag)?;
        self.read_unsigned32_value(len)
    }

    pub fn read_unsigned32_value(&mut self, len: usize) -> SnmpResult<u32> {
        if len == 0 {
            return Err(SnmpError::Malformed("zero-length integer"));
        }
        let bytes = self.read_bytes(len)?;
        let mut value: u32 = 0;
        for &byte in bytes.iter().take(5) {
            value = (value << 8) | u32::from(byte);
        }
        Ok(value)
    }

    pub fn read_unsigned64_value(&mut self, len: usize) -> SnmpResult<u64> {
        if len == 0 || len > 9 {
            return Err(SnmpError::Malformed("bad Counter64 length"));
        }
        let bytes = self.read_bytes(len)?;
        let mut value: u64 = 0;
        for &byte in bytes.iter() {
            value = (value << 8) | u64::from(byte);
        }
        Ok(value)
    }

    pub fn read_octet_string(&mut self) -> SnmpResult<Bytes> {
        let len = self.expect_tag(tag::universal::OCTET_STRING)?;
        self.read_bytes(len)
    }

    pub fn read_null(&mut self) -> SnmpResult<()> {
        let len = self.expect_tag(tag::universal::NULL)?;
        if len != 0 {
            return Err(SnmpError::Malformed("NULL with content"));
        }
        Ok(())
    }

    pub fn read_oid(&mut self) -> SnmpResult<Oid> {
        let len = self.expect_tag(tag::universal::OBJECT_IDENTIFIER)?;
        let bytes = self.read_bytes(len)?;
        Oid::from_ber(&bytes)
    }

    /// Read a SEQUENCE, returning a decoder over its content.
    pub fn read_sequence(&mut self) -> SnmpResult<Decoder> {
        self.read_constructed(tag::universal::SEQUENCE)
    }

    /// Read a constructed type with a specific tag.
    pub fn read_constructed(&mut self, expected_tag: u8) -> SnmpResult<Decoder> {
        let len = self.expect_tag(expected_tag)?;
        let content = self.read_bytes(len)?;
        Ok(Decoder::new(content))
    }
}

/// Reverse-filling BER encoder.
///
/// Every `push_*` call prepends to the logical message, so composite values
/// are written innermost-first and fields within one constructed type are
/// pushed in reverse declaration order.
pub struct EncodeBuf {
    rev: Vec<u8>,
}

impl EncodeBuf {
    pub fn new() -> Self {
        Self {
            rev: Vec::with_capacity(256),
        }
    }

    fn push_raw_reversed(&mut self, bytes: &[u8]) {
        self.rev.extend(bytes.iter().rev());
    }

    pub fn push_tag(&mut self, tag: u8) {
        self.rev.push(tag);
    }

    pub fn push_length(&mut self, len: usize) {
        let (buf, n) = encode_length(len);
        // encode_length already yields reversed bytes
        self.rev.extend_from_slice(&buf[..n]);
    }

    /// Prepend raw content bytes (in logical order).
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_raw_reversed(bytes);
    }

    /// Prepend a constructed TLV whose content is produced by `f`.
    pub fn push_constructed(&mut self, tag: u8, f: impl FnOnce(&mut Self)) {
        let before = self.rev.len();
        f(self);
        let content_len = self.rev.len() - before;
        self.push_length(content_len);
        self.push_tag(tag);
    }

    pub fn push_sequence(&mut self, f: impl FnOnce(&mut Self)) {
        self.push_constructed(tag::universal::SEQUENCE, f);
    }

    /// Prepend a signed INTEGER with minimal two's-complement content.
    pub fn push_integer(&mut self, value: i32) {
        let be = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let cur = be[start];
            let next = be[start + 1];
            let redundant =
                (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        let content = &be[start..];
        self.push_raw_reversed(content);
        self.push_length(content.len());
        self.push_tag(tag::universal::INTEGER);
    }

    /// Prepend an unsigned 32-bit value under the given tag. A leading zero
    /// octet keeps values with the high bit set positive.
    pub fn push_unsigned32(&mut self, tag_byte: u8, value: u32) {
        let be = value.to_be_bytes();
        let mut start = 0;
        while start < 3 && be[start] == 0 {
            start += 1;
        }
        let needs_pad = be[start] & 0x80 != 0;
        let content_len = (4 - start) + usize::from(needs_pad);
        self.push_raw_reversed(&be[start..]);
        if needs_pad {
            self.rev.push(0x00);
        }
        self.push_length(content_len);
        self.push_tag(tag_byte);
    }

    /// Prepend an unsigned 64-bit value (Counter64) under the given tag.
    pub fn push_unsigned64(&mut self, tag_byte: u8, value: u64) {
        let be = value.to_be_bytes();
        let mut start = 0;
        while start < 7 && be[start] == 0 {
            start += 1;
        }
        let needs_pad = be[start] & 0x80 != 0;
        let content_len = (8 - start) + usize::from(needs_pad);
        self.push_raw_reversed(&be[start..]);
        if needs_pad {
            self.rev.push(0x00);
        }
        self.push_length(content_len);
        self.push_tag(tag_byte);
    }

    pub fn push_octet_string(&mut self, bytes: &[u8]) {
        self.push_raw_reversed(bytes);
        self.push_length(bytes.len());
        self.push_tag(tag::universal::OCTET_STRING);
    }

    pub fn push_null(&mut self) {
        self.push_length(0);
        self.push_tag(tag::universal::NULL);
    }

    pub fn push_oid(&mut self, oid: &Oid) {
        let content = oid.to_ber();
        self.push_raw_reversed(&content);
        self.push_length(content.len());
        self.push_tag(tag::universal::OBJECT_IDENTIFIER);
    }

    pub fn push_ip_address(&mut self, addr: [u8; 4]) {
        self.push_raw_reversed(&addr);
        self.push_length(4);
        self.push_tag(tag::application::IP_ADDRESS);
    }

    pub fn finish(mut self) -> Bytes {
        self.rev.reverse();
        Bytes::from(self.rev)
    }
}

impl Default for EncodeBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid;

    #[test]
    fn integer_roundtrip() {
        for value in [0, 1, 127, 128, 255, 256, -1, -128, -129, i32::MAX, i32::MIN] {
            let mut buf = EncodeBuf::new();
            buf.push_integer(value);
            let bytes = buf.finish();
            let mut dec = Decoder::new(bytes);
            assert_eq!(dec.read_integer().unwrap(), value, "value {}", value);
        }
    }

    #[test]
    fn integer_minimal_encoding() {
        let mut buf = EncodeBuf::new();
        buf.push_integer(127);
        assert_eq!(buf.finish().as_ref(), &[0x02, 0x01, 0x7F]);

        let mut buf = EncodeBuf::new();
        buf.push_integer(128);
        assert_eq!(buf.finish().as_ref(), &[0x02, 0x02, 0x00, 0x80]);

        let mut buf = EncodeBuf::new();
        buf.push_integer(-1);
        assert_eq!(buf.finish().as_ref(), &[0x02, 0x01, 0xFF]);
    }

    #[test]
    fn unsigned32_high_bit_padded() {
        let mut buf = EncodeBuf::new();
        buf.push_unsigned32(tag::application::TIMETICKS, 0x8000_0001);
        let bytes = buf.finish();
        assert_eq!(bytes.as_ref(), &[0x43, 0x05, 0x00, 0x80, 0x00, 0x00, 0x01]);
        let mut dec = Decoder::new(bytes);
        assert_eq!(
            dec.read_unsigned32(tag::application::TIMETICKS).unwrap(),
            0x8000_0001
        );
    }

    #[test]
    fn octet_string_roundtrip() {
        let mut buf = EncodeBuf::new();
        buf.push_octet_string(b"public");
        let mut dec = Decoder::new(buf.finish());
        assert_eq!(dec.read_octet_string().unwrap().as_ref(), b"public");
    }

    #[test]
    fn sequence_fields_pushed_in_reverse() {
        // Logical order INTEGER 1, INTEGER 2 requires pushing 2 first.
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            buf.push_integer(2);
            buf.push_integer(1);
        });
        let bytes = buf.finish();
        assert_eq!(
            bytes.as_ref(),
            &[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02]
        );
        let mut seq = Decoder::new(bytes).read_sequence().unwrap();
        assert_eq!(seq.read_integer().unwrap(), 1);
        assert_eq!(seq.read_integer().unwrap(), 2);
    }

    #[test]
    fn oid_roundtrip() {
        let oid = oid!(1, 3, 6, 1, 2, 1, 33, 1, 6, 1, 0);
        let mut buf = EncodeBuf::new();
        buf.push_oid(&oid);
        let mut dec = Decoder::new(buf.finish());
        assert_eq!(dec.read_oid().unwrap(), oid);
    }

    #[test]
    fn length_forms() {
        assert_eq!(decode_length(&[0x05]).unwrap(), (5, 1));
        assert_eq!(decode_length(&[0x81, 0x80]).unwrap(), (128, 2));
        assert_eq!(decode_length(&[0x82, 0x01, 0x00]).unwrap(), (256, 3));
        // non-minimal long form is accepted (X.690 8.1.3.5 note 2)
        assert_eq!(decode_length(&[0x82, 0x00, 0x05]).unwrap(), (5, 3));
        assert!(decode_length(&[0x80]).is_err());
        assert!(decode_length(&[]).is_err());
    }

    #[test]
    fn length_cap_enforced() {
        let over = MAX_LENGTH + 1;
        let data = [
            0x84,
            (over >> 24) as u8,
            (over >> 16) as u8,
            (over >> 8) as u8,
            over as u8,
        ];
        assert!(decode_length(&data).is_err());
    }

    #[test]
    fn decoder_rejects_truncation() {
        let mut dec = Decoder::from_slice(&[0x04, 0x10, 0x01]);
        assert!(dec.read_octet_string().is_err());

        let mut dec = Decoder::from_slice(&[0x02, 0x00]);
        assert!(dec.read_integer().is_err());
    }

    #[test]
    fn decoder_sign_extension() {
        let mut dec = Decoder::from_slice(&[0x02, 0x01, 0x80]);
        assert_eq!(dec.read_integer().unwrap(), -128);
        let mut dec = Decoder::from_slice(&[0x02, 0x02, 0x00, 0x80]);
        assert_eq!(dec.read_integer().unwrap(), 128);
    }
}
