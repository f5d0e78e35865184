//! Session establishment: the connect-request / connect-ok message bodies,
//! certificate policy checks, cipher negotiation, and derivation of the
//! per-direction AEAD contexts.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use photon::cert::{Cert, CertError, CertStore, KeyType, SignedCert};
use photon::crypto::{
    derive_session_keys, KeyExchangePrivateKey, KeyExchangePublicKey, KeyScheduleInput, Role, SessionCrypto,
    SigningPrivateKey, SigningPublicKey, random_u64, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use photon::identity::Identity;
use photon::time::timestamp_secs;

use crate::shared::{Cipher, EndReason, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeError {
    Malformed,
    BadCert(CertError),
    CertRequired,
    IdentityMismatch,
    MissingAppIds,
    AnonymousCertNotAllowed,
    BadCryptSignature,
    BadKeyType,
    BadProtocolVersion,
    ProtocolVersionChanged,
    NoSharedCipher,
}

impl HandshakeError {
    pub fn end_reason(&self) -> EndReason {
        match self {
            HandshakeError::Malformed => EndReason::MiscGeneric,
            HandshakeError::BadCert(_)
            | HandshakeError::IdentityMismatch
            | HandshakeError::MissingAppIds
            | HandshakeError::AnonymousCertNotAllowed => EndReason::RemoteBadCert,
            HandshakeError::CertRequired => EndReason::MiscInternalError,
            HandshakeError::BadCryptSignature | HandshakeError::BadKeyType | HandshakeError::NoSharedCipher => {
                EndReason::RemoteBadCrypt
            }
            HandshakeError::BadProtocolVersion | HandshakeError::ProtocolVersionChanged => {
                EndReason::RemoteBadProtocolVersion
            }
        }
    }
}

/// Allowance for certs that are not CA-signed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnsignedCertPolicy {
    Disallow,
    AllowWarn,
    Allow,
}

// ---------------------------------------------------------------------------
// Crypt info
// ---------------------------------------------------------------------------

/// The key agreement half of the handshake, signed by the cert key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CryptInfo {
    pub protocol_version: u32,
    pub key_type: KeyType,
    pub key_data: [u8; PUBLIC_KEY_SIZE],
    pub nonce: u64,
    pub ciphers: Vec<Cipher>,
}

impl CryptInfo {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.write_u32::<LittleEndian>(self.protocol_version).expect("vec write");
        out.write_u8(self.key_type as u8).expect("vec write");
        out.write_all(&self.key_data).expect("vec write");
        out.write_u64::<LittleEndian>(self.nonce).expect("vec write");
        out.write_u8(self.ciphers.len() as u8).expect("vec write");
        for cipher in &self.ciphers {
            out.write_u8(*cipher as u8).expect("vec write");
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<CryptInfo, HandshakeError> {
        let mut cursor = Cursor::new(bytes);
        let protocol_version = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let key_type = KeyType::from_wire(cursor.read_u8().map_err(|_| HandshakeError::Malformed)?)
            .ok_or(HandshakeError::BadKeyType)?;
        let mut key_data = [0u8; PUBLIC_KEY_SIZE];
        cursor.read_exact(&mut key_data).map_err(|_| HandshakeError::Malformed)?;
        let nonce = cursor.read_u64::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let cipher_count = cursor.read_u8().map_err(|_| HandshakeError::Malformed)? as usize;
        let mut ciphers = Vec::with_capacity(cipher_count);
        for _ in 0..cipher_count {
            let wire = cursor.read_u8().map_err(|_| HandshakeError::Malformed)?;
            // Unknown ciphers from a newer peer are skipped, not fatal.
            if let Some(cipher) = Cipher::from_wire(wire) {
                ciphers.push(cipher);
            }
        }
        Ok(CryptInfo {
            protocol_version,
            key_type,
            key_data,
            nonce,
            ciphers,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedCryptInfo {
    pub info_bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedCryptInfo {
    pub fn sign(info: &CryptInfo, key: &SigningPrivateKey) -> SignedCryptInfo {
        let info_bytes = info.serialize();
        let signature = key.sign(&info_bytes).to_vec();
        SignedCryptInfo { info_bytes, signature }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.info_bytes.len() + SIGNATURE_SIZE + 4);
        out.write_u16::<LittleEndian>(self.info_bytes.len() as u16).expect("vec write");
        out.write_all(&self.info_bytes).expect("vec write");
        out.write_u8(self.signature.len() as u8).expect("vec write");
        out.write_all(&self.signature).expect("vec write");
        out
    }

    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<SignedCryptInfo, HandshakeError> {
        let info_len = cursor.read_u16::<LittleEndian>().map_err(|_| HandshakeError::Malformed)? as usize;
        let mut info_bytes = vec![0u8; info_len];
        cursor.read_exact(&mut info_bytes).map_err(|_| HandshakeError::Malformed)?;
        let sig_len = cursor.read_u8().map_err(|_| HandshakeError::Malformed)? as usize;
        if sig_len != SIGNATURE_SIZE {
            return Err(HandshakeError::Malformed);
        }
        let mut signature = vec![0u8; sig_len];
        cursor.read_exact(&mut signature).map_err(|_| HandshakeError::Malformed)?;
        Ok(SignedCryptInfo { info_bytes, signature })
    }
}

// ---------------------------------------------------------------------------
// Local credentials and per-connection handshake state
// ---------------------------------------------------------------------------

/// This host's identity material: a signing key and the cert vouching for
/// it. Without a CA, hosts run on self-signed certs (empty signature).
pub struct LocalCredentials {
    pub identity: Identity,
    pub signing_key: SigningPrivateKey,
    pub signed_cert: SignedCert,
}

impl LocalCredentials {
    pub fn self_signed(identity: Identity, app_id: u32) -> LocalCredentials {
        let signing_key = SigningPrivateKey::generate();
        let now = timestamp_secs();
        let cert = Cert {
            key_type: KeyType::Ed25519,
            public_key: *signing_key.public_key().as_bytes(),
            identity: Some(identity.clone()),
            app_ids: vec![app_id],
            pop_ids: Vec::new(),
            time_created: now,
            time_expiry: now + 48 * 3600,
        };
        LocalCredentials {
            identity,
            signing_key,
            signed_cert: SignedCert {
                cert_bytes: cert.serialize(),
                ca_key_id: 0,
                signature: Vec::new(),
            },
        }
    }
}

/// Ephemeral per-connection key agreement state. The private key is wiped
/// when this is dropped after key derivation.
pub struct LocalCryptState {
    pub ephemeral: KeyExchangePrivateKey,
    pub nonce: u64,
    pub crypt_info: CryptInfo,
    pub signed: SignedCryptInfo,
}

impl LocalCryptState {
    pub fn new(credentials: &LocalCredentials, ciphers: &[Cipher]) -> LocalCryptState {
        let ephemeral = KeyExchangePrivateKey::generate();
        let crypt_info = CryptInfo {
            protocol_version: PROTOCOL_VERSION,
            key_type: KeyType::X25519,
            key_data: *ephemeral.public_key().as_bytes(),
            nonce: random_u64(),
            ciphers: ciphers.to_vec(),
        };
        let signed = SignedCryptInfo::sign(&crypt_info, &credentials.signing_key);
        LocalCryptState {
            ephemeral,
            nonce: crypt_info.nonce,
            crypt_info,
            signed,
        }
    }
}

// ---------------------------------------------------------------------------
// Peer validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PeerCertInfo {
    pub cert: Cert,
    pub signing_key: SigningPublicKey,
    /// Chain-evaluated rights, for CA-signed certs.
    pub auth_scope: Option<photon::cert::AuthScope>,
}

/// Validates the peer's cert against the store and local policy, and binds
/// it to the expected identity.
pub fn validate_peer_cert(
    signed: &SignedCert,
    expected_identity: Option<&Identity>,
    cert_store: &CertStore,
    unsigned_policy: UnsignedCertPolicy,
    now_secs: u64,
) -> Result<PeerCertInfo, HandshakeError> {
    let cert = signed.parse_cert().map_err(HandshakeError::BadCert)?;
    if cert.key_type != KeyType::Ed25519 {
        return Err(HandshakeError::BadKeyType);
    }
    let signing_key = SigningPublicKey::from_bytes(&cert.public_key)
        .ok_or(HandshakeError::BadCert(CertError::Malformed))?;

    let localhost_peer = expected_identity.map(Identity::is_local_host).unwrap_or(false)
        || cert.identity.as_ref().map(Identity::is_local_host).unwrap_or(false);

    let mut auth_scope = None;
    if signed.is_ca_signed() {
        let scope = cert_store.verify(signed, now_secs).map_err(HandshakeError::BadCert)?;

        match &cert.identity {
            Some(identity) if !identity.is_local_host() => {
                if let Some(expected) = expected_identity {
                    if expected != identity {
                        return Err(HandshakeError::IdentityMismatch);
                    }
                }
            }
            Some(_) => {}
            None => {
                // Anonymous CA-signed certs are only for anonymous
                // dedicated servers, and only when pinned to a datacenter.
                let anonymous_peer = expected_identity.map(Identity::accepts_anonymous_cert).unwrap_or(false);
                if !anonymous_peer || cert.pop_ids.is_empty() {
                    return Err(HandshakeError::AnonymousCertNotAllowed);
                }
            }
        }
        if cert.identity.is_some() && cert.app_ids.is_empty() {
            return Err(HandshakeError::MissingAppIds);
        }
        auth_scope = Some(scope);
    } else {
        // Self-signed. Localhost forces acceptance; otherwise policy rules.
        if unsigned_policy == UnsignedCertPolicy::Disallow && !localhost_peer {
            return Err(HandshakeError::CertRequired);
        }
        if let (Some(expected), Some(claimed)) = (expected_identity, &cert.identity) {
            if !claimed.is_local_host() && expected != claimed {
                return Err(HandshakeError::IdentityMismatch);
            }
        }
    }

    Ok(PeerCertInfo {
        cert,
        signing_key,
        auth_scope,
    })
}

/// Verifies the crypt-info signature and contents (spec steps 4 and 5).
pub fn validate_crypt_info(
    peer_cert: &PeerCertInfo,
    signed: &SignedCryptInfo,
    known_protocol_version: Option<u32>,
) -> Result<CryptInfo, HandshakeError> {
    if !peer_cert.signing_key.verify(&signed.info_bytes, &signed.signature) {
        return Err(HandshakeError::BadCryptSignature);
    }
    let info = CryptInfo::parse(&signed.info_bytes)?;
    if info.key_type != KeyType::X25519 {
        return Err(HandshakeError::BadKeyType);
    }
    if info.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(HandshakeError::BadProtocolVersion);
    }
    if let Some(known) = known_protocol_version {
        if known != 0 && known != info.protocol_version {
            return Err(HandshakeError::ProtocolVersionChanged);
        }
    }
    Ok(info)
}

/// Picks the first cipher acceptable to both sides, in our preference
/// order. The acceptor answers with exactly that one cipher.
pub fn negotiate_cipher(local_prefs: &[Cipher], peer_ciphers: &[Cipher]) -> Option<Cipher> {
    local_prefs.iter().copied().find(|c| peer_ciphers.contains(c))
}

/// Everything needed to compute the session keys once both crypt infos are
/// known.
pub struct KeyEstablishment<'a> {
    pub role: Role,
    pub local_conn_id: u32,
    pub remote_conn_id: u32,
    pub local_cert_bytes: &'a [u8],
    pub remote_cert_bytes: &'a [u8],
    pub local_crypt_bytes: &'a [u8],
    pub remote_crypt_bytes: &'a [u8],
}

/// Runs the key exchange and schedule, returning the per-direction AEAD
/// pair. All secret intermediates are wiped before returning.
pub fn establish_session_crypto(
    local: &LocalCryptState,
    peer_info: &CryptInfo,
    params: &KeyEstablishment<'_>,
) -> SessionCrypto {
    let peer_public = KeyExchangePublicKey::from_bytes(peer_info.key_data);
    let premaster = local.ephemeral.shared_secret(&peer_public);

    let (client_nonce, server_nonce) = match params.role {
        Role::Client => (local.nonce, peer_info.nonce),
        Role::Server => (peer_info.nonce, local.nonce),
    };
    let (client_conn_id, server_conn_id) = match params.role {
        Role::Client => (params.local_conn_id, params.remote_conn_id),
        Role::Server => (params.remote_conn_id, params.local_conn_id),
    };
    let (client_cert, server_cert) = match params.role {
        Role::Client => (params.local_cert_bytes, params.remote_cert_bytes),
        Role::Server => (params.remote_cert_bytes, params.local_cert_bytes),
    };
    let (client_crypt, server_crypt) = match params.role {
        Role::Client => (params.local_crypt_bytes, params.remote_crypt_bytes),
        Role::Server => (params.remote_crypt_bytes, params.local_crypt_bytes),
    };

    let keys = derive_session_keys(
        &premaster,
        &KeyScheduleInput {
            client_nonce,
            server_nonce,
            client_conn_id,
            server_conn_id,
            client_cert,
            server_cert,
            client_crypt,
            server_crypt,
        },
        params.role,
    );
    SessionCrypto::from_keys(&keys)
}

// ---------------------------------------------------------------------------
// Connect exchange bodies
// ---------------------------------------------------------------------------

fn write_blob(out: &mut Vec<u8>, blob: &[u8]) {
    out.write_u16::<LittleEndian>(blob.len() as u16).expect("vec write");
    out.write_all(blob).expect("vec write");
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, HandshakeError> {
    let len = cursor.read_u16::<LittleEndian>().map_err(|_| HandshakeError::Malformed)? as usize;
    let mut blob = vec![0u8; len];
    cursor.read_exact(&mut blob).map_err(|_| HandshakeError::Malformed)?;
    Ok(blob)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectRequest {
    pub client_conn_id: u32,
    pub identity: Identity,
    pub cert: SignedCert,
    pub crypt: SignedCryptInfo,
}

impl ConnectRequest {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.write_u32::<LittleEndian>(self.client_conn_id).expect("vec write");
        write_blob(&mut out, self.identity.to_string().as_bytes());
        write_blob(&mut out, &self.cert.serialize());
        out.extend_from_slice(&self.crypt.serialize());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<ConnectRequest, HandshakeError> {
        let mut cursor = Cursor::new(bytes);
        let client_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let identity_raw = read_blob(&mut cursor)?;
        let identity = String::from_utf8(identity_raw)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(HandshakeError::Malformed)?;
        let cert_raw = read_blob(&mut cursor)?;
        let cert = SignedCert::parse(&cert_raw).map_err(HandshakeError::BadCert)?;
        let crypt = SignedCryptInfo::parse(&mut cursor)?;
        Ok(ConnectRequest {
            client_conn_id,
            identity,
            cert,
            crypt,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectOk {
    pub client_conn_id: u32,
    pub server_conn_id: u32,
    pub identity: Identity,
    pub cert: SignedCert,
    pub crypt: SignedCryptInfo,
}

impl ConnectOk {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.write_u32::<LittleEndian>(self.client_conn_id).expect("vec write");
        out.write_u32::<LittleEndian>(self.server_conn_id).expect("vec write");
        write_blob(&mut out, self.identity.to_string().as_bytes());
        write_blob(&mut out, &self.cert.serialize());
        out.extend_from_slice(&self.crypt.serialize());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<ConnectOk, HandshakeError> {
        let mut cursor = Cursor::new(bytes);
        let client_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let server_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let identity_raw = read_blob(&mut cursor)?;
        let identity = String::from_utf8(identity_raw)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(HandshakeError::Malformed)?;
        let cert_raw = read_blob(&mut cursor)?;
        let cert = SignedCert::parse(&cert_raw).map_err(HandshakeError::BadCert)?;
        let crypt = SignedCryptInfo::parse(&mut cursor)?;
        Ok(ConnectOk {
            client_conn_id,
            server_conn_id,
            identity,
            cert,
            crypt,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionClosed {
    pub to_conn_id: u32,
    pub from_conn_id: u32,
    pub reason: u32,
    pub debug: String,
}

impl ConnectionClosed {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.debug.len());
        out.write_u32::<LittleEndian>(self.to_conn_id).expect("vec write");
        out.write_u32::<LittleEndian>(self.from_conn_id).expect("vec write");
        out.write_u32::<LittleEndian>(self.reason).expect("vec write");
        write_blob(&mut out, self.debug.as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<ConnectionClosed, HandshakeError> {
        let mut cursor = Cursor::new(bytes);
        let to_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let from_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let reason = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let debug_raw = read_blob(&mut cursor)?;
        let debug = String::from_utf8_lossy(&debug_raw).into_owned();
        Ok(ConnectionClosed {
            to_conn_id,
            from_conn_id,
            reason,
            debug,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NoConnection {
    pub to_conn_id: u32,
    pub from_conn_id: u32,
}

impl NoConnection {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.write_u32::<LittleEndian>(self.to_conn_id).expect("vec write");
        out.write_u32::<LittleEndian>(self.from_conn_id).expect("vec write");
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<NoConnection, HandshakeError> {
        let mut cursor = Cursor::new(bytes);
        let to_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        let from_conn_id = cursor.read_u32::<LittleEndian>().map_err(|_| HandshakeError::Malformed)?;
        Ok(NoConnection { to_conn_id, from_conn_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon::cert::AuthScope;
    use photon::cert::PopId;

    fn credentials(identity: Identity) -> LocalCredentials {
        LocalCredentials::self_signed(identity, 440)
    }

    #[test]
    fn test_crypt_info_roundtrip() {
        let credentials = credentials(Identity::Named("peer".into()));
        let state = LocalCryptState::new(&credentials, &[Cipher::Aes256Gcm, Cipher::Null]);
        let parsed = CryptInfo::parse(&state.signed.info_bytes).unwrap();
        assert_eq!(parsed, state.crypt_info);
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_negotiate_cipher_policy_table() {
        use Cipher::{Aes256Gcm, Null};
        // Required-encryption initiator, flexible acceptor.
        assert_eq!(negotiate_cipher(&[Aes256Gcm], &[Aes256Gcm, Null]), Some(Aes256Gcm));
        // Prefer-plain acceptor still honors its own ordering.
        assert_eq!(negotiate_cipher(&[Null, Aes256Gcm], &[Aes256Gcm, Null]), Some(Null));
        // Incompatible demands.
        assert_eq!(negotiate_cipher(&[Aes256Gcm], &[Null]), None);
    }

    #[test]
    fn test_validate_self_signed_policies() {
        let peer = credentials(Identity::Named("svc".into()));
        let store = CertStore::new();
        let now = timestamp_secs();

        assert!(validate_peer_cert(
            &peer.signed_cert,
            Some(&Identity::Named("svc".into())),
            &store,
            UnsignedCertPolicy::Allow,
            now
        )
        .is_ok());

        assert_eq!(
            validate_peer_cert(
                &peer.signed_cert,
                Some(&Identity::Named("svc".into())),
                &store,
                UnsignedCertPolicy::Disallow,
                now
            )
            .unwrap_err(),
            HandshakeError::CertRequired
        );

        // Localhost always passes self-signed.
        let local_peer = credentials(Identity::LocalHost);
        assert!(validate_peer_cert(
            &local_peer.signed_cert,
            Some(&Identity::LocalHost),
            &store,
            UnsignedCertPolicy::Disallow,
            now
        )
        .is_ok());
    }

    #[test]
    fn test_validate_identity_mismatch() {
        let peer = credentials(Identity::Named("impostor".into()));
        let store = CertStore::new();
        assert_eq!(
            validate_peer_cert(
                &peer.signed_cert,
                Some(&Identity::Named("real".into())),
                &store,
                UnsignedCertPolicy::Allow,
                timestamp_secs()
            )
            .unwrap_err(),
            HandshakeError::IdentityMismatch
        );
    }

    fn ca_signed(
        ca: &SigningPrivateKey,
        identity: Option<Identity>,
        apps: Vec<u32>,
        pops: Vec<PopId>,
    ) -> (SigningPrivateKey, SignedCert) {
        let key = SigningPrivateKey::generate();
        let now = timestamp_secs();
        let cert = Cert {
            key_type: KeyType::Ed25519,
            public_key: *key.public_key().as_bytes(),
            identity,
            app_ids: apps,
            pop_ids: pops,
            time_created: now - 10,
            time_expiry: now + 3600,
        };
        let cert_bytes = cert.serialize();
        let signature = ca.sign(&cert_bytes).to_vec();
        (
            key,
            SignedCert {
                cert_bytes,
                ca_key_id: ca.public_key().key_id(),
                signature,
            },
        )
    }

    #[test]
    fn test_validate_ca_signed_and_anonymous_rules() {
        let ca = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));
        let now = timestamp_secs();

        // Named cert binds to the expected identity.
        let (_, named) = ca_signed(&ca, Some(Identity::Named("fleet-7".into())), vec![440], vec![]);
        assert!(validate_peer_cert(
            &named,
            Some(&Identity::Named("fleet-7".into())),
            &store,
            UnsignedCertPolicy::Disallow,
            now
        )
        .is_ok());

        // Anonymous cert, datacenter scoped, for an anonymous server peer.
        let pop = PopId::from_code("fra").unwrap();
        let (_, anon) = ca_signed(&ca, None, vec![440], vec![pop]);
        assert!(validate_peer_cert(
            &anon,
            Some(&Identity::AnonymousServer(3)),
            &store,
            UnsignedCertPolicy::Disallow,
            now
        )
        .is_ok());

        // Same cert for a named peer: refused.
        assert_eq!(
            validate_peer_cert(
                &anon,
                Some(&Identity::Named("someone".into())),
                &store,
                UnsignedCertPolicy::Disallow,
                now
            )
            .unwrap_err(),
            HandshakeError::AnonymousCertNotAllowed
        );

        // Anonymous cert without a datacenter scope: refused.
        let (_, anon_unscoped) = ca_signed(&ca, None, vec![440], vec![]);
        assert_eq!(
            validate_peer_cert(
                &anon_unscoped,
                Some(&Identity::AnonymousServer(3)),
                &store,
                UnsignedCertPolicy::Disallow,
                now
            )
            .unwrap_err(),
            HandshakeError::AnonymousCertNotAllowed
        );

        // Identity present but no app ids: refused.
        let (_, no_apps) = ca_signed(&ca, Some(Identity::Named("fleet-8".into())), vec![], vec![]);
        assert_eq!(
            validate_peer_cert(
                &no_apps,
                Some(&Identity::Named("fleet-8".into())),
                &store,
                UnsignedCertPolicy::Disallow,
                now
            )
            .unwrap_err(),
            HandshakeError::MissingAppIds
        );
    }

    #[test]
    fn test_validate_crypt_info_checks() {
        let peer = credentials(Identity::Named("svc".into()));
        let store = CertStore::new();
        let info = validate_peer_cert(
            &peer.signed_cert,
            None,
            &store,
            UnsignedCertPolicy::Allow,
            timestamp_secs(),
        )
        .unwrap();

        let state = LocalCryptState::new(&peer, &[Cipher::Aes256Gcm]);
        assert!(validate_crypt_info(&info, &state.signed, None).is_ok());
        assert!(validate_crypt_info(&info, &state.signed, Some(PROTOCOL_VERSION)).is_ok());
        assert_eq!(
            validate_crypt_info(&info, &state.signed, Some(PROTOCOL_VERSION - 1)).unwrap_err(),
            HandshakeError::ProtocolVersionChanged
        );

        // Tampered signature.
        let mut tampered = state.signed.clone();
        tampered.signature[5] ^= 1;
        assert_eq!(
            validate_crypt_info(&info, &tampered, None).unwrap_err(),
            HandshakeError::BadCryptSignature
        );

        // Version below the floor.
        let mut old = state.crypt_info.clone();
        old.protocol_version = MIN_PROTOCOL_VERSION - 1;
        let old_signed = SignedCryptInfo::sign(&old, &peer.signing_key);
        assert_eq!(
            validate_crypt_info(&info, &old_signed, None).unwrap_err(),
            HandshakeError::BadProtocolVersion
        );
    }

    #[test]
    fn test_establish_session_crypto_role_symmetry() {
        let client_creds = credentials(Identity::Named("client".into()));
        let server_creds = credentials(Identity::Named("server".into()));
        let client_state = LocalCryptState::new(&client_creds, &[Cipher::Aes256Gcm]);
        let server_state = LocalCryptState::new(&server_creds, &[Cipher::Aes256Gcm]);

        let client_crypto = establish_session_crypto(
            &client_state,
            &server_state.crypt_info,
            &KeyEstablishment {
                role: Role::Client,
                local_conn_id: 11,
                remote_conn_id: 22,
                local_cert_bytes: &client_creds.signed_cert.cert_bytes,
                remote_cert_bytes: &server_creds.signed_cert.cert_bytes,
                local_crypt_bytes: &client_state.signed.info_bytes,
                remote_crypt_bytes: &server_state.signed.info_bytes,
            },
        );
        let server_crypto = establish_session_crypto(
            &server_state,
            &client_state.crypt_info,
            &KeyEstablishment {
                role: Role::Server,
                local_conn_id: 22,
                remote_conn_id: 11,
                local_cert_bytes: &server_creds.signed_cert.cert_bytes,
                remote_cert_bytes: &client_creds.signed_cert.cert_bytes,
                local_crypt_bytes: &server_state.signed.info_bytes,
                remote_crypt_bytes: &client_state.signed.info_bytes,
            },
        );

        let wire = client_crypto.send.encrypt(2, b"first data packet");
        assert_eq!(server_crypto.recv.decrypt(2, &wire).unwrap(), b"first data packet");
        let wire = server_crypto.send.encrypt(2, b"reply");
        assert_eq!(client_crypto.recv.decrypt(2, &wire).unwrap(), b"reply");
    }

    #[test]
    fn test_connect_bodies_roundtrip() {
        let creds = credentials(Identity::Named("client".into()));
        let state = LocalCryptState::new(&creds, &[Cipher::Aes256Gcm]);

        let request = ConnectRequest {
            client_conn_id: 0xaabb_0001,
            identity: creds.identity.clone(),
            cert: creds.signed_cert.clone(),
            crypt: state.signed.clone(),
        };
        assert_eq!(ConnectRequest::parse(&request.serialize()).unwrap(), request);

        let ok = ConnectOk {
            client_conn_id: 0xaabb_0001,
            server_conn_id: 0xccdd_0002,
            identity: Identity::Named("server".into()),
            cert: creds.signed_cert.clone(),
            crypt: state.signed.clone(),
        };
        assert_eq!(ConnectOk::parse(&ok.serialize()).unwrap(), ok);

        let closed = ConnectionClosed {
            to_conn_id: 1,
            from_conn_id: 2,
            reason: EndReason::App(3).to_wire(),
            debug: "done".into(),
        };
        assert_eq!(ConnectionClosed::parse(&closed.serialize()).unwrap(), closed);

        let none = NoConnection { to_conn_id: 1, from_conn_id: 2 };
        assert_eq!(NoConnection::parse(&none.serialize()).unwrap(), none);
    }

    #[test]
    fn test_parse_err_truncated_bodies() {
        let creds = credentials(Identity::Named("client".into()));
        let state = LocalCryptState::new(&creds, &[Cipher::Aes256Gcm]);
        let request = ConnectRequest {
            client_conn_id: 1,
            identity: creds.identity.clone(),
            cert: creds.signed_cert.clone(),
            crypt: state.signed.clone(),
        };
        let bytes = request.serialize();
        assert_eq!(
            ConnectRequest::parse(&bytes[..bytes.len() - 1]).unwrap_err(),
            HandshakeError::Malformed
        );
    }
}
