//! Cryptographic primitives: random generation, hashing, elliptic-curve keys,
//! authenticated symmetric encryption, and the session key schedule.
//!
//! All secret material is wiped when dropped. Long-lived objects hold only
//! what they need to operate; intermediates (premaster secrets, PRKs, digest
//! scratch) are zeroized before the deriving function returns.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use byteorder::{ByteOrder, LittleEndian};
use ed25519_dalek::{Signer, Verifier};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SYMMETRIC_KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const SHARED_SECRET_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

#[inline]
pub fn random_u32() -> u32 {
    OsRng.next_u32()
}

#[inline]
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[inline]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Which end of the handshake this host is. The initiator of the connect
/// request is the client; the acceptor is the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

// ---------------------------------------------------------------------------
// Key exchange (X25519)
// ---------------------------------------------------------------------------

/// Ephemeral key-exchange private key. Wiped on drop by the curve library.
pub struct KeyExchangePrivateKey(x25519_dalek::StaticSecret);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyExchangePublicKey([u8; PUBLIC_KEY_SIZE]);

impl KeyExchangePrivateKey {
    #[inline]
    pub fn generate() -> KeyExchangePrivateKey {
        KeyExchangePrivateKey(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> KeyExchangePrivateKey {
        KeyExchangePrivateKey(x25519_dalek::StaticSecret::from(bytes))
    }

    #[inline]
    pub fn public_key(&self) -> KeyExchangePublicKey {
        KeyExchangePublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Runs the key exchange against the peer's public key. The premaster
    /// secret is the SHA-256 digest of the raw curve point, never the point
    /// itself.
    pub fn shared_secret(&self, peer: &KeyExchangePublicKey) -> SharedSecret {
        let point = self.0.diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));
        SharedSecret(sha256(point.as_bytes()))
    }
}

impl KeyExchangePublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> KeyExchangePublicKey {
        KeyExchangePublicKey(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

/// Premaster secret produced by the key exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Signing (Ed25519)
// ---------------------------------------------------------------------------

pub struct SigningPrivateKey(ed25519_dalek::SigningKey);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningPublicKey(ed25519_dalek::VerifyingKey);

impl SigningPrivateKey {
    #[inline]
    pub fn generate() -> SigningPrivateKey {
        SigningPrivateKey(ed25519_dalek::SigningKey::generate(&mut OsRng))
    }

    #[inline]
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> SigningPrivateKey {
        SigningPrivateKey(ed25519_dalek::SigningKey::from_bytes(bytes))
    }

    #[inline]
    pub fn public_key(&self) -> SigningPublicKey {
        SigningPublicKey(self.0.verifying_key())
    }

    #[inline]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.0.sign(message).to_bytes()
    }
}

impl SigningPublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Option<SigningPublicKey> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .ok()
            .map(SigningPublicKey)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(sig_bytes) = <&[u8; SIGNATURE_SIZE]>::try_from(signature) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(sig_bytes);
        self.0.verify(message, &sig).is_ok()
    }

    /// Short identifier for keys in stores and on the wire: the first 8 bytes
    /// of the SHA-256 of the public key, little endian.
    pub fn key_id(&self) -> u64 {
        key_id_for_public_key(self.as_bytes())
    }
}

#[inline]
pub fn key_id_for_public_key(public_key: &[u8]) -> u64 {
    let digest = sha256(public_key);
    LittleEndian::read_u64(&digest[..8])
}

// ---------------------------------------------------------------------------
// AEAD (AES-256-GCM)
// ---------------------------------------------------------------------------

/// One direction of symmetric packet protection. The IV for a packet is the
/// base IV with its first 8 bytes XORed with the little-endian packet number,
/// so packet numbers must never repeat within a session.
pub struct AeadContext {
    cipher: Aes256Gcm,
    base_iv: [u8; IV_SIZE],
}

impl AeadContext {
    pub fn new(key: &[u8; SYMMETRIC_KEY_SIZE], base_iv: [u8; IV_SIZE]) -> AeadContext {
        AeadContext {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            base_iv,
        }
    }

    fn packet_iv(&self, pkt_num: i64) -> [u8; IV_SIZE] {
        let mut iv = self.base_iv;
        let mut counter = [0u8; 8];
        LittleEndian::write_u64(&mut counter, pkt_num as u64);
        for (iv_byte, counter_byte) in iv.iter_mut().zip(counter.iter()) {
            *iv_byte ^= counter_byte;
        }
        iv
    }

    /// Encrypts and authenticates the payload. Output is ciphertext with the
    /// 16-byte tag appended. No additional authenticated data is used.
    pub fn encrypt(&self, pkt_num: i64, plain: &[u8]) -> Vec<u8> {
        let iv = self.packet_iv(pkt_num);
        self.cipher
            .encrypt(Nonce::from_slice(&iv), plain)
            .expect("AES-GCM encryption is infallible for in-memory buffers")
    }

    /// Returns the plaintext, or `None` if authentication fails.
    pub fn decrypt(&self, pkt_num: i64, cipher_text: &[u8]) -> Option<Vec<u8>> {
        if cipher_text.len() < TAG_SIZE {
            return None;
        }
        let iv = self.packet_iv(pkt_num);
        self.cipher.decrypt(Nonce::from_slice(&iv), cipher_text).ok()
    }
}

impl Drop for AeadContext {
    fn drop(&mut self) {
        self.base_iv.zeroize();
    }
}

// ---------------------------------------------------------------------------
// Session key schedule
// ---------------------------------------------------------------------------

/// The four derived outputs, named from the deriving host's perspective.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send_key: [u8; SYMMETRIC_KEY_SIZE],
    pub recv_key: [u8; SYMMETRIC_KEY_SIZE],
    pub send_iv: [u8; IV_SIZE],
    pub recv_iv: [u8; IV_SIZE],
}

/// Role-independent inputs to the key schedule. All fields are named by
/// handshake role; each host fills them from its own view of the exchange.
pub struct KeyScheduleInput<'a> {
    pub client_nonce: u64,
    pub server_nonce: u64,
    pub client_conn_id: u32,
    pub server_conn_id: u32,
    pub client_cert: &'a [u8],
    pub server_cert: &'a [u8],
    pub client_crypt: &'a [u8],
    pub server_crypt: &'a [u8],
}

const KEY_SCHEDULE_LABEL: &[u8; 14] = b"Steam datagram";

/// Derives the session keys from the premaster secret.
///
/// Extract: `PRK = HMAC-SHA256(server_nonce_le64 || client_nonce_le64, premaster)`.
/// Expand: four HMAC rounds over a context of a 32-byte digest scratch, the
/// connection ids, a fixed label and the four length-prefixed handshake
/// blobs, with the trailing context byte set to the round index. Round
/// outputs in order: client-to-server key, server-to-client key,
/// client-to-server IV, server-to-client IV. Both roles compute identical
/// round outputs; only the send/recv assignment differs.
pub fn derive_session_keys(premaster: &SharedSecret, input: &KeyScheduleInput<'_>, role: Role) -> SessionKeys {
    let mut salt = [0u8; 16];
    LittleEndian::write_u64(&mut salt[..8], input.server_nonce);
    LittleEndian::write_u64(&mut salt[8..], input.client_nonce);

    let mut prk = hmac_sha256(&salt, premaster.as_bytes());

    // Context layout: scratch(32) | conn ids | label | length-prefixed blobs | round byte
    let mut context = Vec::with_capacity(
        32 + 8
            + KEY_SCHEDULE_LABEL.len()
            + 16
            + input.client_cert.len()
            + input.server_cert.len()
            + input.client_crypt.len()
            + input.server_crypt.len()
            + 1,
    );
    context.extend_from_slice(&[0u8; 32]);
    let mut id_bytes = [0u8; 8];
    LittleEndian::write_u32(&mut id_bytes[..4], input.client_conn_id);
    LittleEndian::write_u32(&mut id_bytes[4..], input.server_conn_id);
    context.extend_from_slice(&id_bytes);
    context.extend_from_slice(KEY_SCHEDULE_LABEL);
    for blob in [input.server_cert, input.client_cert, input.server_crypt, input.client_crypt] {
        let mut len_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut len_bytes, blob.len() as u32);
        context.extend_from_slice(&len_bytes);
        context.extend_from_slice(blob);
    }
    context.push(0);

    let mut rounds = [[0u8; 32]; 4];
    for (index, round) in rounds.iter_mut().enumerate() {
        *context.last_mut().expect("context is never empty") = (index + 1) as u8;
        let digest = hmac_sha256(&prk, &context);
        round.copy_from_slice(&digest);
        context[..32].copy_from_slice(&digest);
    }

    let mut keys = SessionKeys {
        send_key: [0; SYMMETRIC_KEY_SIZE],
        recv_key: [0; SYMMETRIC_KEY_SIZE],
        send_iv: [0; IV_SIZE],
        recv_iv: [0; IV_SIZE],
    };
    let (to_server_key, to_client_key) = (&rounds[0], &rounds[1]);
    let (to_server_iv, to_client_iv) = (&rounds[2][..IV_SIZE], &rounds[3][..IV_SIZE]);
    match role {
        Role::Client => {
            keys.send_key.copy_from_slice(to_server_key);
            keys.recv_key.copy_from_slice(to_client_key);
            keys.send_iv.copy_from_slice(to_server_iv);
            keys.recv_iv.copy_from_slice(to_client_iv);
        }
        Role::Server => {
            keys.send_key.copy_from_slice(to_client_key);
            keys.recv_key.copy_from_slice(to_server_key);
            keys.send_iv.copy_from_slice(to_client_iv);
            keys.recv_iv.copy_from_slice(to_server_iv);
        }
    }

    salt.zeroize();
    prk.zeroize();
    context.zeroize();
    for round in rounds.iter_mut() {
        round.zeroize();
    }
    keys
}

/// Per-direction AEAD pair for one established session.
pub struct SessionCrypto {
    pub send: AeadContext,
    pub recv: AeadContext,
}

impl SessionCrypto {
    pub fn from_keys(keys: &SessionKeys) -> SessionCrypto {
        SessionCrypto {
            send: AeadContext::new(&keys.send_key, keys.send_iv),
            recv: AeadContext::new(&keys.recv_key, keys.recv_iv),
        }
    }
}
