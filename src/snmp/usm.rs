//! User-based Security Model for SNMPv3 (RFC 3414, RFC 7860, RFC 3826).
//!
//! Covers what an authoritative agent needs: password-to-key derivation and
//! localisation, truncated-HMAC authentication, DES-CBC and AES-CFB privacy,
//! and the UsmSecurityParameters codec.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use digest::{Digest, KeyInit, Mac};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::ber::{tag, Decoder, EncodeBuf};
use super::error::{SnmpError, SnmpResult};

/// Authentication protocols (RFC 3414, RFC 7860).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl AuthProtocol {
    /// Digest output length; also the localised key length.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Truncated MAC length carried in msgAuthenticationParameters.
    pub fn mac_len(self) -> usize {
        match self {
            Self::Md5 | Self::Sha1 => 12,
            Self::Sha224 => 16,
            Self::Sha256 => 24,
            Self::Sha384 => 32,
            Self::Sha512 => 48,
        }
    }
}

impl FromStr for AuthProtocol {
    type Err = SnmpError;

    fn from_str(s: &str) -> SnmpResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA" | "SHA1" | "SHA-1" => Ok(Self::Sha1),
            "SHA224" | "SHA-224" => Ok(Self::Sha224),
            "SHA256" | "SHA-256" => Ok(Self::Sha256),
            "SHA384" | "SHA-384" => Ok(Self::Sha384),
            "SHA512" | "SHA-512" => Ok(Self::Sha512),
            _ => Err(SnmpError::Auth("unknown authentication protocol")),
        }
    }
}

/// Privacy protocols. The `C` spellings are the configuration names used by
/// gosnmp-compatible deployments: same cipher as the plain variant, keys
/// extended when the auth digest is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivProtocol {
    Des,
    Aes128,
    Aes192,
    Aes192C,
    Aes256,
    Aes256C,
}

impl PrivProtocol {
    /// Cipher key length. DES additionally consumes 8 pre-IV bytes beyond
    /// its 8-byte key.
    pub fn key_len(self) -> usize {
        match self {
            Self::Des => 16,
            Self::Aes128 => 16,
            Self::Aes192 | Self::Aes192C => 24,
            Self::Aes256 | Self::Aes256C => 32,
        }
    }
}

impl FromStr for PrivProtocol {
    type Err = SnmpError;

    fn from_str(s: &str) -> SnmpResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DES" => Ok(Self::Des),
            "AES" | "AES128" | "AES-128" => Ok(Self::Aes128),
            "AES192" | "AES-192" => Ok(Self::Aes192),
            "AES192C" => Ok(Self::Aes192C),
            "AES256" | "AES-256" => Ok(Self::Aes256),
            "AES256C" => Ok(Self::Aes256C),
            _ => Err(SnmpError::Auth("unknown privacy protocol")),
        }
    }
}

/// Password-to-key transformation (RFC 3414 Section A.2.1): hash a 1 MiB
/// repetition of the password in 64-byte chunks.
fn password_to_key(protocol: AuthProtocol, password: &[u8]) -> Vec<u8> {
    match protocol {
        AuthProtocol::Md5 => password_to_key_impl::<md5::Md5>(password),
        AuthProtocol::Sha1 => password_to_key_impl::<sha1::Sha1>(password),
        AuthProtocol::Sha224 => password_to_key_impl::<sha2::Sha224>(password),
        AuthProtocol::Sha256 => password_to_key_impl::<sha2::Sha256>(password),
        AuthProtocol::Sha384 => password_to_key_impl::<sha2::Sha384>(password),
        AuthProtocol::Sha512 => password_to_key_impl::<sha2::Sha512>(password),
    }
}

fn password_to_key_impl<D: Digest>(password: &[u8]) -> Vec<u8> {
    const EXPANSION_SIZE: usize = 1_048_576;

    if password.is_empty() {
        return vec![0u8; <D as Digest>::output_size()];
    }

    let mut hasher = D::new();
    let mut buf = [0u8; 64];
    let mut index = 0;
    let mut count = 0;
    while count < EXPANSION_SIZE {
        for byte in &mut buf {
            *byte = password[index];
            index = (index + 1) % password.len();
        }
        hasher.update(buf);
        count += 64;
    }
    hasher.finalize().to_vec()
}

/// Key localisation (RFC 3414 Section A.2.2):
/// `Kul = H(Ku || engineID || Ku)`.
fn localize(protocol: AuthProtocol, master: &[u8], engine_id: &[u8]) -> Vec<u8> {
    fn go<D: Digest>(master: &[u8], engine_id: &[u8]) -> Vec<u8> {
        let mut hasher = D::new();
        hasher.update(master);
        hasher.update(engine_id);
        hasher.update(master);
        hasher.finalize().to_vec()
    }
    match protocol {
        AuthProtocol::Md5 => go::<md5::Md5>(master, engine_id),
        AuthProtocol::Sha1 => go::<sha1::Sha1>(master, engine_id),
        AuthProtocol::Sha224 => go::<sha2::Sha224>(master, engine_id),
        AuthProtocol::Sha256 => go::<sha2::Sha256>(master, engine_id),
        AuthProtocol::Sha384 => go::<sha2::Sha384>(master, engine_id),
        AuthProtocol::Sha512 => go::<sha2::Sha512>(master, engine_id),
    }
}

/// Blumenthal key extension (draft-blumenthal-aes-usm-04): append the hash
/// of the accumulated key until enough material exists.
fn extend_key(protocol: AuthProtocol, key: &[u8], needed: usize) -> Vec<u8> {
    fn hash_of(protocol: AuthProtocol, data: &[u8]) -> Vec<u8> {
        fn go<D: Digest>(data: &[u8]) -> Vec<u8> {
            D::digest(data).to_vec()
        }
        match protocol {
            AuthProtocol::Md5 => go::<md5::Md5>(data),
            AuthProtocol::Sha1 => go::<sha1::Sha1>(data),
            AuthProtocol::Sha224 => go::<sha2::Sha224>(data),
            AuthProtocol::Sha256 => go::<sha2::Sha256>(data),
            AuthProtocol::Sha384 => go::<sha2::Sha384>(data),
            AuthProtocol::Sha512 => go::<sha2::Sha512>(data),
        }
    }

    let mut extended = key.to_vec();
    while extended.len() < needed {
        let digest = hash_of(protocol, &extended);
        extended.extend_from_slice(&digest);
    }
    extended.truncate(needed);
    extended
}

macro_rules! hmac_fn {
    ($name:ident, $digest:ty) => {
        fn $name(key: &[u8], data: &[u8], truncate: usize) -> Vec<u8> {
            type H = hmac::Hmac<$digest>;
            let mut mac = <H as KeyInit>::new_from_slice(key).expect("HMAC accepts any key size");
            Mac::update(&mut mac, data);
            let out = mac.finalize().into_bytes();
            out[..truncate].to_vec()
        }
    };
}

hmac_fn!(hmac_md5, md5::Md5);
hmac_fn!(hmac_sha1, sha1::Sha1);
hmac_fn!(hmac_sha224, sha2::Sha224);
hmac_fn!(hmac_sha256, sha2::Sha256);
hmac_fn!(hmac_sha384, sha2::Sha384);
hmac_fn!(hmac_sha512, sha2::Sha512);

fn compute_hmac(protocol: AuthProtocol, key: &[u8], data: &[u8]) -> Vec<u8> {
    let truncate = protocol.mac_len();
    match protocol {
        AuthProtocol::Md5 => hmac_md5(key, data, truncate),
        AuthProtocol::Sha1 => hmac_sha1(key, data, truncate),
        AuthProtocol::Sha224 => hmac_sha224(key, data, truncate),
        AuthProtocol::Sha256 => hmac_sha256(key, data, truncate),
        AuthProtocol::Sha384 => hmac_sha384(key, data, truncate),
        AuthProtocol::Sha512 => hmac_sha512(key, data, truncate),
    }
}

/// Localised authentication key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LocalizedKey {
    key: Vec<u8>,
    #[zeroize(skip)]
    protocol: AuthProtocol,
}

impl LocalizedKey {
    pub fn from_password(protocol: AuthProtocol, password: &[u8], engine_id: &[u8]) -> Self {
        let master = password_to_key(protocol, password);
        let key = localize(protocol, &master, engine_id);
        Self { key, protocol }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn mac_len(&self) -> usize {
        self.protocol.mac_len()
    }

    pub fn compute_hmac(&self, data: &[u8]) -> Vec<u8> {
        compute_hmac(self.protocol, &self.key, data)
    }

    /// Constant-time MAC comparison.
    pub fn verify_hmac(&self, data: &[u8], expected: &[u8]) -> bool {
        let computed = self.compute_hmac(data);
        if computed.len() != expected.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in computed.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl std::fmt::Debug for LocalizedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalizedKey")
            .field("protocol", &self.protocol)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Patch the HMAC over an encoded message whose auth-params field holds
/// placeholder zeros.
pub fn authenticate_message(key: &LocalizedKey, message: &mut [u8], offset: usize, len: usize) {
    let mac = key.compute_hmac(message);
    message[offset..offset + len].copy_from_slice(&mac);
}

/// Verify the HMAC of an incoming message by zeroing the auth-params field
/// and recomputing.
pub fn verify_message(key: &LocalizedKey, message: &[u8], offset: usize, len: usize) -> bool {
    if offset + len > message.len() {
        return false;
    }
    let received = &message[offset..offset + len];
    let mut copy = message.to_vec();
    copy[offset..offset + len].fill(0);
    key.verify_hmac(&copy, received)
}

/// Thread-safe salt counter seeded from OS randomness; never yields zero.
pub struct SaltCounter(AtomicU64);

impl SaltCounter {
    pub fn new() -> Self {
        let mut buf = [0u8; 8];
        let seed = loop {
            getrandom::fill(&mut buf).expect("getrandom failed");
            let val = u64::from_ne_bytes(buf);
            if val != 0 {
                break val;
            }
        };
        Self(AtomicU64::new(seed))
    }

    pub fn next(&self) -> u64 {
        let val = self.0.fetch_add(1, Ordering::SeqCst);
        if val == 0 {
            self.0.fetch_add(1, Ordering::SeqCst)
        } else {
            val
        }
    }
}

impl Default for SaltCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Localised privacy key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivKey {
    key: Vec<u8>,
    #[zeroize(skip)]
    protocol: PrivProtocol,
}

impl PrivKey {
    /// Derive the privacy key: same localisation as auth keys (RFC 3826
    /// Section 1.2), extended when the digest is shorter than the cipher key.
    pub fn from_password(
        auth_protocol: AuthProtocol,
        priv_protocol: PrivProtocol,
        password: &[u8],
        engine_id: &[u8],
    ) -> Self {
        let master = password_to_key(auth_protocol, password);
        let localized = localize(auth_protocol, &master, engine_id);
        let key = if localized.len() < priv_protocol.key_len() {
            extend_key(auth_protocol, &localized, priv_protocol.key_len())
        } else {
            localized
        };
        Self {
            key,
            protocol: priv_protocol,
        }
    }

    pub fn protocol(&self) -> PrivProtocol {
        self.protocol
    }

    /// Encrypt a scoped PDU, returning (ciphertext, privParameters).
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        engine_boots: u32,
        engine_time: u32,
        salt: u64,
    ) -> SnmpResult<(Bytes, Bytes)> {
        match self.protocol {
            PrivProtocol::Des => self.encrypt_des(plaintext, engine_boots, salt),
            _ => self.encrypt_aes(plaintext, engine_boots, engine_time, salt),
        }
    }

    /// Decrypt a scoped PDU using the message's privParameters.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        engine_boots: u32,
        engine_time: u32,
        priv_params: &[u8],
    ) -> SnmpResult<Bytes> {
        if priv_params.len() != 8 {
            return Err(SnmpError::Crypto("privParameters must be 8 octets"));
        }
        match self.protocol {
            PrivProtocol::Des => self.decrypt_des(ciphertext, priv_params),
            _ => self.decrypt_aes(ciphertext, engine_boots, engine_time, priv_params),
        }
    }

    /// DES-CBC (RFC 3414 Section 8.1.1): salt = boots || counter,
    /// IV = pre-IV XOR salt, zero-pad to block size.
    fn encrypt_des(&self, plaintext: &[u8], engine_boots: u32, salt_int: u64) -> SnmpResult<(Bytes, Bytes)> {
        use cbc::cipher::{BlockEncryptMut, KeyIvInit};
        type DesCbc = cbc::Encryptor<des::Des>;

        let key = &self.key[..8];
        let pre_iv = &self.key[8..16];

        let mut salt = [0u8; 8];
        salt[..4].copy_from_slice(&engine_boots.to_be_bytes());
        salt[4..].copy_from_slice(&(salt_int as u32).to_be_bytes());

        let mut iv = [0u8; 8];
        for i in 0..8 {
            iv[i] = pre_iv[i] ^ salt[i];
        }

        let padded_len = plaintext.len().div_ceil(8) * 8;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);

        let cipher = DesCbc::new_from_slices(key, &iv)
            .map_err(|_| SnmpError::Crypto("bad DES key length"))?;
        let ciphertext = cipher
            .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buffer, padded_len)
            .map_err(|_| SnmpError::Crypto("DES encrypt failed"))?;

        Ok((
            Bytes::copy_from_slice(ciphertext),
            Bytes::copy_from_slice(&salt),
        ))
    }

    fn decrypt_des(&self, ciphertext: &[u8], priv_params: &[u8]) -> SnmpResult<Bytes> {
        use cbc::cipher::{BlockDecryptMut, KeyIvInit};
        type DesCbc = cbc::Decryptor<des::Des>;

        if ciphertext.len() % 8 != 0 {
            return Err(SnmpError::Crypto("DES ciphertext not block-aligned"));
        }

        let key = &self.key[..8];
        let pre_iv = &self.key[8..16];
        let mut iv = [0u8; 8];
        for i in 0..8 {
            iv[i] = pre_iv[i] ^ priv_params[i];
        }

        let cipher = DesCbc::new_from_slices(key, &iv)
            .map_err(|_| SnmpError::Crypto("bad DES key length"))?;
        let mut buffer = ciphertext.to_vec();
        let plaintext = cipher
            .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buffer)
            .map_err(|_| SnmpError::Crypto("DES decrypt failed"))?;

        Ok(Bytes::copy_from_slice(plaintext))
    }

    /// AES-CFB (RFC 3826 Section 3.1): salt is a 64-bit counter,
    /// IV = boots || time || salt (concatenation, not XOR).
    fn encrypt_aes(
        &self,
        plaintext: &[u8],
        engine_boots: u32,
        engine_time: u32,
        salt: u64,
    ) -> SnmpResult<(Bytes, Bytes)> {
        let salt_bytes = salt.to_be_bytes();
        let iv = aes_iv(engine_boots, engine_time, &salt_bytes);

        let mut buffer = plaintext.to_vec();
        self.run_aes_cfb(&mut buffer, &iv, true)?;

        Ok((Bytes::from(buffer), Bytes::copy_from_slice(&salt_bytes)))
    }

    fn decrypt_aes(
        &self,
        ciphertext: &[u8],
        engine_boots: u32,
        engine_time: u32,
        priv_params: &[u8],
    ) -> SnmpResult<Bytes> {
        let iv = aes_iv(engine_boots, engine_time, priv_params);

        let mut buffer = ciphertext.to_vec();
        self.run_aes_cfb(&mut buffer, &iv, false)?;

        Ok(Bytes::from(buffer))
    }

    fn run_aes_cfb(&self, buffer: &mut [u8], iv: &[u8; 16], encrypt: bool) -> SnmpResult<()> {
        use aes::{Aes128, Aes192, Aes256};
        use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};

        let key_len = self.protocol.key_len();
        let key = &self.key[..key_len];

        macro_rules! run {
            ($cipher:ty) => {{
                if encrypt {
                    let cipher = cfb_mode::Encryptor::<$cipher>::new_from_slices(key, iv)
                        .map_err(|_| SnmpError::Crypto("bad AES key length"))?;
                    cipher.encrypt(buffer);
                } else {
                    let cipher = cfb_mode::Decryptor::<$cipher>::new_from_slices(key, iv)
                        .map_err(|_| SnmpError::Crypto("bad AES key length"))?;
                    cipher.decrypt(buffer);
                }
            }};
        }

        match key_len {
            16 => run!(Aes128),
            24 => run!(Aes192),
            32 => run!(Aes256),
            _ => return Err(SnmpError::Crypto("unsupported AES key length")),
        }
        Ok(())
    }
}

fn aes_iv(engine_boots: u32, engine_time: u32, salt: &[u8]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&engine_boots.to_be_bytes());
    iv[4..8].copy_from_slice(&engine_time.to_be_bytes());
    iv[8..].copy_from_slice(salt);
    iv
}

impl std::fmt::Debug for PrivKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivKey")
            .field("protocol", &self.protocol)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// A configured USM user.
#[derive(Clone)]
pub struct UsmUser {
    pub username: Bytes,
    pub auth: Option<(AuthProtocol, Vec<u8>)>,
    pub privacy: Option<(PrivProtocol, Vec<u8>)>,
}

/// Keys localised to one engine ID.
pub struct DerivedKeys {
    pub auth_key: Option<LocalizedKey>,
    pub priv_key: Option<PrivKey>,
}

impl UsmUser {
    pub fn new(username: impl Into<Bytes>) -> Self {
        Self {
            username: username.into(),
            auth: None,
            privacy: None,
        }
    }

    pub fn security_level(&self) -> super::message::SecurityLevel {
        use super::message::SecurityLevel;
        match (&self.auth, &self.privacy) {
            (None, _) => SecurityLevel::NoAuthNoPriv,
            (Some(_), None) => SecurityLevel::AuthNoPriv,
            (Some(_), Some(_)) => SecurityLevel::AuthPriv,
        }
    }

    /// Password-to-key is ~1 ms; done once per user at startup and cached by
    /// the caller.
    pub fn derive_keys(&self, engine_id: &[u8]) -> DerivedKeys {
        let auth_key = self
            .auth
            .as_ref()
            .map(|(protocol, password)| LocalizedKey::from_password(*protocol, password, engine_id));

        let priv_key = match (&self.auth, &self.privacy) {
            (Some((auth_protocol, _)), Some((priv_protocol, password))) => Some(
                PrivKey::from_password(*auth_protocol, *priv_protocol, password, engine_id),
            ),
            _ => None,
        };

        DerivedKeys { auth_key, priv_key }
    }
}

impl std::fmt::Debug for UsmUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsmUser")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("auth", &self.auth.as_ref().map(|(p, _)| *p))
            .field("privacy", &self.privacy.as_ref().map(|(p, _)| *p))
            .finish()
    }
}

/// UsmSecurityParameters (RFC 3414): a BER SEQUENCE carried inside the
/// msgSecurityParameters OCTET STRING.
#[derive(Debug, Clone)]
pub struct UsmSecurityParams {
    pub engine_id: Bytes,
    pub engine_boots: u32,
    pub engine_time: u32,
    pub username: Bytes,
    pub auth_params: Bytes,
    pub priv_params: Bytes,
}

impl UsmSecurityParams {
    pub fn new(
        engine_id: impl Into<Bytes>,
        engine_boots: u32,
        engine_time: u32,
        username: impl Into<Bytes>,
    ) -> Self {
        Self {
            engine_id: engine_id.into(),
            engine_boots,
            engine_time,
            username: username.into(),
            auth_params: Bytes::new(),
            priv_params: Bytes::new(),
        }
    }

    /// Zero placeholder for the HMAC; patched after the full message is
    /// encoded.
    pub fn with_auth_placeholder(mut self, mac_len: usize) -> Self {
        self.auth_params = Bytes::from(vec![0u8; mac_len]);
        self
    }

    pub fn with_priv_params(mut self, priv_params: impl Into<Bytes>) -> Self {
        self.priv_params = priv_params.into();
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            buf.push_octet_string(&self.priv_params);
            buf.push_octet_string(&self.auth_params);
            buf.push_octet_string(&self.username);
            buf.push_unsigned32(tag::universal::INTEGER, self.engine_time);
            buf.push_unsigned32(tag::universal::INTEGER, self.engine_boots);
            buf.push_octet_string(&self.engine_id);
        });
        buf.finish()
    }

    pub fn decode(data: Bytes) -> SnmpResult<Self> {
        let mut decoder = Decoder::new(data);
        let mut seq = decoder.read_sequence()?;

        let engine_id = seq.read_octet_string()?;
        let boots = seq.read_integer()?;
        let time = seq.read_integer()?;
        if boots < 0 || time < 0 {
            return Err(SnmpError::Malformed("negative engine boots/time"));
        }
        let username = seq.read_octet_string()?;
        let auth_params = seq.read_octet_string()?;
        let priv_params = seq.read_octet_string()?;

        Ok(Self {
            engine_id,
            engine_boots: boots as u32,
            engine_time: time as u32,
            username,
            auth_params,
            priv_params,
        })
    }

    /// Locate msgAuthenticationParameters inside a fully encoded v3 message,
    /// returning (offset, length). Needed to patch or verify the HMAC, which
    /// is computed over the whole message with that field zeroed.
    pub fn find_auth_params_offset(encoded: &[u8]) -> Option<(usize, usize)> {
        let mut offset = 0;

        // outer SEQUENCE header
        offset = enter_constructed(encoded, offset, 0x30)?;
        // version INTEGER
        offset = skip_tlv(encoded, offset)?;
        // msgGlobalData SEQUENCE
        offset = skip_tlv(encoded, offset)?;
        // msgSecurityParameters OCTET STRING header
        offset = enter_constructed(encoded, offset, 0x04)?;
        // USM SEQUENCE header
        offset = enter_constructed(encoded, offset, 0x30)?;
        // engineID, boots, time, username
        for _ in 0..4 {
            offset = skip_tlv(encoded, offset)?;
        }
        // msgAuthenticationParameters OCTET STRING
        if *encoded.get(offset)? != 0x04 {
            return None;
        }
        offset += 1;
        let (len, len_size) = scan_length(encoded, offset)?;
        Some((offset + len_size, len))
    }
}

fn scan_length(data: &[u8], offset: usize) -> Option<(usize, usize)> {
    super::ber::decode_length(data.get(offset..)?)
        .ok()
        .map(|(len, consumed)| (len, consumed))
}

/// Step past a tag + length, landing on the content.
fn enter_constructed(data: &[u8], offset: usize, expected_tag: u8) -> Option<usize> {
    if *data.get(offset)? != expected_tag {
        return None;
    }
    let (_, len_size) = scan_length(data, offset + 1)?;
    Some(offset + 1 + len_size)
}

/// Step past an entire TLV.
fn skip_tlv(data: &[u8], offset: usize) -> Option<usize> {
    data.get(offset)?;
    let (len, len_size) = scan_length(data, offset + 1)?;
    let next = offset + 1 + len_size + len;
    if next > data.len() {
        return None;
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn to_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn password_to_key_md5_rfc_vector() {
        // RFC 3414 Appendix A.3.1
        let key = password_to_key(AuthProtocol::Md5, b"maplesyrup");
        assert_eq!(to_hex(&key), "9faf3283884e92834ebc9847d8edd963");
    }

    #[test]
    fn password_to_key_sha1_rfc_vector() {
        // RFC 3414 Appendix A.3.2
        let key = password_to_key(AuthProtocol::Sha1, b"maplesyrup");
        assert_eq!(to_hex(&key), "9fb5cc0381497b3793528939ff788d5d79145211");
    }

    #[test]
    fn localized_key_md5_rfc_vector() {
        let engine_id = hex("000000000000000000000002");
        let key = LocalizedKey::from_password(AuthProtocol::Md5, b"maplesyrup", &engine_id);
        assert_eq!(to_hex(key.as_bytes()), "526f5eed9fcce26f8964c2930787d82b");
    }

    #[test]
    fn localized_key_sha1_rfc_vector() {
        let engine_id = hex("000000000000000000000002");
        let key = LocalizedKey::from_password(AuthProtocol::Sha1, b"maplesyrup", &engine_id);
        assert_eq!(
            to_hex(key.as_bytes()),
            "6695febc9288e36282235fc7151f128497b38f3f"
        );
    }

    #[test]
    fn hmac_truncation_and_verify() {
        let key = LocalizedKey::from_password(AuthProtocol::Sha256, b"authpass123", b"engine");
        let mac = key.compute_hmac(b"message");
        assert_eq!(mac.len(), 24);
        assert!(key.verify_hmac(b"message", &mac));

        let mut bad = mac.clone();
        bad[0] ^= 0xFF;
        assert!(!key.verify_hmac(b"message", &bad));
        assert!(!key.verify_hmac(b"other message", &mac));
    }

    #[test]
    fn message_authentication_patches_placeholder() {
        let key = LocalizedKey::from_password(AuthProtocol::Md5, b"maplesyrup", b"engine");
        let mut message = vec![0u8; 64];
        message[..4].copy_from_slice(b"head");
        let (offset, len) = (10, key.mac_len());

        authenticate_message(&key, &mut message, offset, len);
        assert!(verify_message(&key, &message, offset, len));

        message[0] ^= 0x01;
        assert!(!verify_message(&key, &message, offset, len));
    }

    #[test]
    fn des_roundtrip() {
        let key = PrivKey::from_password(
            AuthProtocol::Md5,
            PrivProtocol::Des,
            b"privpass123",
            b"engine-id",
        );
        let plaintext = b"scoped pdu contents, not block aligned";
        let (ciphertext, salt) = key.encrypt(plaintext, 1, 1000, 77).unwrap();
        assert_eq!(salt.len(), 8);
        assert_eq!(ciphertext.len() % 8, 0);

        let decrypted = key.decrypt(&ciphertext, 1, 1000, &salt).unwrap();
        // DES zero-pads; the plaintext is a prefix of the decryption
        assert_eq!(&decrypted[..plaintext.len()], plaintext);
    }

    #[test]
    fn aes_roundtrip_all_key_sizes() {
        for protocol in [
            PrivProtocol::Aes128,
            PrivProtocol::Aes192,
            PrivProtocol::Aes192C,
            PrivProtocol::Aes256,
            PrivProtocol::Aes256C,
        ] {
            let key = PrivKey::from_password(
                AuthProtocol::Sha1, // short digest: forces key extension for 192/256
                protocol,
                b"privpass123",
                b"engine-id",
            );
            let plaintext = b"any length works in CFB mode";
            let (ciphertext, salt) = key.encrypt(plaintext, 3, 42, 123_456).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len());
            let decrypted = key.decrypt(&ciphertext, 3, 42, &salt).unwrap();
            assert_eq!(decrypted.as_ref(), plaintext, "{:?}", protocol);
        }
    }

    #[test]
    fn aes_decrypt_needs_matching_iv() {
        let key = PrivKey::from_password(
            AuthProtocol::Sha256,
            PrivProtocol::Aes128,
            b"privpass123",
            b"engine-id",
        );
        let (ciphertext, salt) = key.encrypt(b"secret", 1, 100, 5).unwrap();
        let wrong = key.decrypt(&ciphertext, 1, 101, &salt).unwrap();
        assert_ne!(wrong.as_ref(), b"secret");
    }

    #[test]
    fn usm_params_roundtrip() {
        let params = UsmSecurityParams::new(Bytes::from_static(b"engine"), 2, 12345, "operator")
            .with_auth_placeholder(12)
            .with_priv_params(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]));
        let decoded = UsmSecurityParams::decode(params.encode()).unwrap();
        assert_eq!(decoded.engine_id.as_ref(), b"engine");
        assert_eq!(decoded.engine_boots, 2);
        assert_eq!(decoded.engine_time, 12345);
        assert_eq!(decoded.username.as_ref(), b"operator");
        assert_eq!(decoded.auth_params.len(), 12);
        assert_eq!(decoded.priv_params.len(), 8);
    }

    #[test]
    fn auth_params_offset_scan() {
        use crate::oid;
        use crate::snmp::message::{MsgFlags, MsgGlobalData, ScopedPdu, SecurityLevel, V3Message};
        use crate::snmp::pdu::{Pdu, PduType};
        use crate::snmp::value::VarBind;

        let usm = UsmSecurityParams::new(Bytes::from_static(b"engine"), 1, 5, "operator")
            .with_auth_placeholder(12);
        let scoped = ScopedPdu::new(
            Bytes::from_static(b"engine"),
            Bytes::new(),
            Pdu {
                pdu_type: PduType::GetRequest,
                request_id: 1,
                error_status: 0,
                error_index: 0,
                varbinds: vec![VarBind::null(oid!(1, 3, 6, 1, 2, 1, 33, 1, 1, 1, 0))],
            },
        );
        let msg = V3Message::new(
            MsgGlobalData::new(1, 65507, MsgFlags::new(SecurityLevel::AuthNoPriv, true)),
            usm.encode(),
            scoped,
        );
        let encoded = msg.encode();

        let (offset, len) = UsmSecurityParams::find_auth_params_offset(&encoded).unwrap();
        assert_eq!(len, 12);
        assert!(encoded[offset..offset + len].iter().all(|&b| b == 0));
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("md5".parse::<AuthProtocol>().unwrap(), AuthProtocol::Md5);
        assert_eq!("SHA".parse::<AuthProtocol>().unwrap(), AuthProtocol::Sha1);
        assert_eq!(
            "SHA512".parse::<AuthProtocol>().unwrap(),
            AuthProtocol::Sha512
        );
        assert!("rot13".parse::<AuthProtocol>().is_err());

        assert_eq!("AES".parse::<PrivProtocol>().unwrap(), PrivProtocol::Aes128);
        assert_eq!(
            "AES192C".parse::<PrivProtocol>().unwrap(),
            PrivProtocol::Aes192C
        );
        assert_eq!(
            "aes256c".parse::<PrivProtocol>().unwrap(),
            PrivProtocol::Aes256C
        );
        assert!("ROT13".parse::<PrivProtocol>().is_err());
    }

    #[test]
    fn user_security_level() {
        let user = UsmUser::new(Bytes::from_static(b"u"));
        assert_eq!(
            user.security_level(),
            crate::snmp::message::SecurityLevel::NoAuthNoPriv
        );

        let user = UsmUser {
            username: Bytes::from_static(b"u"),
            auth: Some((AuthProtocol::Sha256, b"authpass".to_vec())),
            privacy: Some((PrivProtocol::Aes128, b"privpass".to_vec())),
        };
        assert_eq!(
            user.security_level(),
            crate::snmp::message::SecurityLevel::AuthPriv
        );
        let keys = user.derive_keys(b"engine");
        assert!(keys.auth_key.is_some());
        assert!(keys.priv_key.is_some());
    }
}
