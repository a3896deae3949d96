use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::RngCore;
use sha2::Sha256;

use crate::error::Error;

pub const RECORD_HEADER_LEN: usize = 5;
pub const TAG_LEN: usize = 16;
/// Header + AEAD tag + inner content-type byte.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_LEN + TAG_LEN + 1;
/// Smallest encrypted record: one plaintext byte.
pub const MIN_APP_RECORD_LEN: usize = RECORD_OVERHEAD + 1;
/// Smallest budget [`TlsSession::client_hello`] fills exactly; below it the
/// padding extension cannot be fitted.
pub const MIN_HELLO_LEN: usize = 96;
/// Smallest budget [`TlsSession::server_flight`] fills exactly. It bounds
/// every record the session emits, so data packets sized at or above it
/// never overshoot their slot.
pub const MIN_FLIGHT_LEN: usize = 145;

const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_APPDATA: u8 = 23;
const LEGACY_VERSION: [u8; 2] = [0x03, 0x03];
const CIPHER_TLS_CHACHA20_POLY1305_SHA256: [u8; 2] = [0x13, 0x03];

/// Static key material baked into the generator. Session traffic keys are
/// derived from it plus the hello randoms, so every capture stays
/// decryptable offline with the hellos alone.
pub const STATIC_SECRET: [u8; 32] = [
    0x66, 0x6c, 0x6f, 0x77, 0x67, 0x65, 0x6e, 0x2d, 0x74, 0x6c, 0x73, 0x2d, 0x73, 0x74, 0x61,
    0x74, 0x69, 0x63, 0x2d, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, 0x2d, 0x76, 0x31, 0x00, 0x00,
    0x00, 0x01,
];

/// Session progression. Application data is only emitted in `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Unstarted,
    HandshakeInProgress,
    Established,
    Closed,
}

struct DirectionKeys {
    key: [u8; 32],
    iv: [u8; 12],
    seq: u64,
}

impl DirectionKeys {
    fn nonce(&self) -> [u8; 12] {
        let mut nonce = self.iv;
        for (i, b) in self.seq.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= b;
        }
        nonce
    }
}

/// One TLS session as seen on the wire: handshake records first, then
/// framed and genuinely encrypted application records.
pub struct TlsSession {
    state: TlsState,
    client_random: [u8; 32],
    server_random: [u8; 32],
    session_id: [u8; 32],
    client: Option<DirectionKeys>,
    server: Option<DirectionKeys>,
}

/// Direction of a record relative to the connection initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSender {
    Client,
    Server,
}

impl TlsSession {
    pub fn new(rng: &mut impl RngCore) -> Self {
        let mut client_random = [0u8; 32];
        let mut server_random = [0u8; 32];
        let mut session_id = [0u8; 32];
        rng.fill_bytes(&mut client_random);
        rng.fill_bytes(&mut server_random);
        rng.fill_bytes(&mut session_id);
        TlsSession {
            state: TlsState::Unstarted,
            client_random,
            server_random,
            session_id,
            client: None,
            server: None,
        }
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    /// ClientHello record, padded to `budget` bytes when possible (the
    /// padding extension absorbs the slack). Moves to `HandshakeInProgress`.
    pub fn client_hello(&mut self, budget: usize) -> Result<Vec<u8>, Error> {
        if self.state != TlsState::Unstarted {
            return Err(Error::ProtocolBuild(format!(
                "ClientHello in state {:?}",
                self.state
            )));
        }
        self.state = TlsState::HandshakeInProgress;

        let mut body = Vec::with_capacity(budget.max(128));
        body.extend_from_slice(&LEGACY_VERSION);
        body.extend_from_slice(&self.client_random);
        body.push(32);
        body.extend_from_slice(&self.session_id);
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&CIPHER_TLS_CHACHA20_POLY1305_SHA256);
        body.extend_from_slice(&[1, 0]); // null compression

        let mut extensions = Vec::new();
        // supported_versions: TLS 1.3
        extensions.extend_from_slice(&43u16.to_be_bytes());
        extensions.extend_from_slice(&3u16.to_be_bytes());
        extensions.extend_from_slice(&[2, 0x03, 0x04]);
        // padding extension fills the record up to the budget
        let base_len = RECORD_HEADER_LEN + 4 + body.len() + 2 + extensions.len();
        if budget > base_len + 4 {
            let pad = budget - base_len - 4;
            extensions.extend_from_slice(&21u16.to_be_bytes());
            extensions.extend_from_slice(&(pad as u16).to_be_bytes());
            extensions.resize(extensions.len() + pad, 0);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        Ok(handshake_record(1, &body))
    }

    /// ServerHello record followed by an encrypted Finished record; the
    /// session is `Established` afterwards.
    pub fn server_flight(&mut self, budget: usize) -> Result<Vec<u8>, Error> {
        if self.state != TlsState::HandshakeInProgress {
            return Err(Error::ProtocolBuild(format!(
                "ServerHello in state {:?}",
                self.state
            )));
        }

        let mut body = Vec::with_capacity(128);
        body.extend_from_slice(&LEGACY_VERSION);
        body.extend_from_slice(&self.server_random);
        body.push(32);
        body.extend_from_slice(&self.session_id);
        body.extend_from_slice(&CIPHER_TLS_CHACHA20_POLY1305_SHA256);
        body.push(0); // null compression
        // supported_versions answer
        body.extend_from_slice(&6u16.to_be_bytes());
        body.extend_from_slice(&43u16.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x03, 0x04]);
        let mut flight = handshake_record(2, &body);

        self.derive_keys();
        self.state = TlsState::Established;

        // Finished, wrapped like any TLS 1.3 post-hello handshake message
        let mut finished = vec![20, 0, 0, 32];
        finished.extend_from_slice(&hmac_like_verify(&self.server_random, &self.client_random));
        let pad = budget.saturating_sub(flight.len() + finished.len() + RECORD_OVERHEAD);
        let record = self.seal(TlsSender::Server, CONTENT_HANDSHAKE, &finished, pad)?;
        flight.extend_from_slice(&record);
        Ok(flight)
    }

    /// Derives traffic keys and moves straight to `Established` without
    /// emitting a server flight. Used when the schedule never gives the
    /// server a handshake slot.
    pub fn establish(&mut self) {
        if self.state == TlsState::HandshakeInProgress {
            self.derive_keys();
            self.state = TlsState::Established;
        }
    }

    /// One encrypted application-data record of exactly `budget` bytes
    /// (bounded below by [`MIN_APP_RECORD_LEN`]).
    pub fn app_record(
        &mut self,
        sender: TlsSender,
        rng: &mut impl RngCore,
        budget: usize,
    ) -> Result<Vec<u8>, Error> {
        if self.state != TlsState::Established {
            return Err(Error::ProtocolBuild(format!(
                "application data in state {:?}",
                self.state
            )));
        }
        let plaintext_len = budget.max(MIN_APP_RECORD_LEN) - RECORD_OVERHEAD;
        let mut plaintext = vec![0u8; plaintext_len];
        rng.fill_bytes(&mut plaintext);
        self.seal(sender, CONTENT_APPDATA, &plaintext, 0)
    }

    /// Encrypted close_notify alert; the session is `Closed` afterwards.
    pub fn close_notify(&mut self, sender: TlsSender) -> Result<Vec<u8>, Error> {
        if self.state != TlsState::Established {
            return Err(Error::ProtocolBuild(format!(
                "close_notify in state {:?}",
                self.state
            )));
        }
        self.state = TlsState::Closed;
        self.seal(sender, CONTENT_ALERT, &[1, 0], 0)
    }

    fn derive_keys(&mut self) {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(&self.client_random);
        salt[32..].copy_from_slice(&self.server_random);
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &STATIC_SECRET);
        self.client = Some(expand_direction(&hkdf, b"c ap traffic"));
        self.server = Some(expand_direction(&hkdf, b"s ap traffic"));
    }

    /// TLS 1.3 style record protection: inner content type appended to the
    /// plaintext (plus optional zero padding), AEAD over the record header.
    fn seal(
        &mut self,
        sender: TlsSender,
        inner_type: u8,
        content: &[u8],
        pad: usize,
    ) -> Result<Vec<u8>, Error> {
        let keys = match sender {
            TlsSender::Client => self.client.as_mut(),
            TlsSender::Server => self.server.as_mut(),
        }
        .ok_or_else(|| Error::ProtocolBuild("record before key derivation".to_string()))?;

        let mut inner = Vec::with_capacity(content.len() + 1 + pad);
        inner.extend_from_slice(content);
        inner.push(inner_type);
        inner.resize(inner.len() + pad, 0);

        let ciphertext_len = inner.len() + TAG_LEN;
        let mut header = [0u8; RECORD_HEADER_LEN];
        header[0] = CONTENT_APPDATA; // outer type is always application data
        header[1..3].copy_from_slice(&LEGACY_VERSION);
        header[3..5].copy_from_slice(&(ciphertext_len as u16).to_be_bytes());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.key));
        let nonce = keys.nonce();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &inner,
                    aad: &header,
                },
            )
            .map_err(|_| Error::ProtocolBuild("record encryption failed".to_string()))?;
        keys.seq += 1;

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + ciphertext.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }
}

fn expand_direction(hkdf: &Hkdf<Sha256>, label: &[u8]) -> DirectionKeys {
    let mut okm = [0u8; 44];
    hkdf.expand(label, &mut okm)
        .expect("44 bytes is a valid HKDF-SHA256 output length");
    let mut key = [0u8; 32];
    let mut iv = [0u8; 12];
    key.copy_from_slice(&okm[..32]);
    iv.copy_from_slice(&okm[32..]);
    DirectionKeys { key, iv, seq: 0 }
}

/// Deterministic stand-in for the Finished verify_data; carries no secret.
fn hmac_like_verify(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Plaintext handshake record wrapping one handshake message.
fn handshake_record(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + 4 + body.len());
    record.push(CONTENT_HANDSHAKE);
    record.extend_from_slice(&LEGACY_VERSION);
    record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    record.push(msg_type);
    let len = body.len() as u32;
    record.extend_from_slice(&len.to_be_bytes()[1..]);
    record.extend_from_slice(body);
    record
}
