//! Certificates binding an identity and authorization scope to a signing key,
//! and the store that evaluates trust chains.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SigningPublicKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::encoding;
use crate::identity::Identity;

/// Point-of-presence (datacenter) code: up to four ASCII characters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PopId(pub u32);

impl PopId {
    pub fn from_code(code: &str) -> Option<PopId> {
        if code.is_empty() || code.len() > 4 || !code.bytes().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        let mut value = 0u32;
        for byte in code.bytes() {
            value = (value << 8) | byte as u32;
        }
        Some(PopId(value))
    }
}

impl fmt::Display for PopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for shift in (0..4).rev() {
            let byte = ((self.0 >> (shift * 8)) & 0xff) as u8;
            if byte != 0 {
                write!(f, "{}", byte as char)?;
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyType {
    Ed25519 = 1,
    X25519 = 2,
}

impl KeyType {
    pub fn from_wire(value: u8) -> Option<KeyType> {
        match value {
            1 => Some(KeyType::Ed25519),
            2 => Some(KeyType::X25519),
            _ => None,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum CertError {
    Malformed,
    BadKeyType,
    BadIdentity,
    UnknownCa,
    BadSignature,
    Revoked,
    Expired,
    NotYetValid,
    TrustCycle,
}

pub type CertResult<T> = Result<T, CertError>;

/// The payload that gets signed: a public key, an optional identity, and the
/// authorization the signer vouches for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cert {
    pub key_type: KeyType,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub identity: Option<Identity>,
    pub app_ids: Vec<u32>,
    pub pop_ids: Vec<PopId>,
    pub time_created: u64,
    pub time_expiry: u64,
}

impl Cert {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.write_u8(self.key_type as u8).expect("vec write");
        out.write_all(&self.public_key).expect("vec write");
        match &self.identity {
            Some(identity) => {
                let text = identity.to_string();
                out.write_u16::<LittleEndian>(text.len() as u16).expect("vec write");
                out.write_all(text.as_bytes()).expect("vec write");
            }
            None => out.write_u16::<LittleEndian>(0).expect("vec write"),
        }
        out.write_u8(self.app_ids.len() as u8).expect("vec write");
        for app in &self.app_ids {
            out.write_u32::<LittleEndian>(*app).expect("vec write");
        }
        out.write_u8(self.pop_ids.len() as u8).expect("vec write");
        for pop in &self.pop_ids {
            out.write_u32::<LittleEndian>(pop.0).expect("vec write");
        }
        out.write_u64::<LittleEndian>(self.time_created).expect("vec write");
        out.write_u64::<LittleEndian>(self.time_expiry).expect("vec write");
        out
    }

    pub fn parse(bytes: &[u8]) -> CertResult<Cert> {
        let mut cursor = Cursor::new(bytes);
        let key_type = KeyType::from_wire(cursor.read_u8().map_err(|_| CertError::Malformed)?)
            .ok_or(CertError::BadKeyType)?;
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        cursor.read_exact(&mut public_key).map_err(|_| CertError::Malformed)?;

        let identity_len = cursor.read_u16::<LittleEndian>().map_err(|_| CertError::Malformed)? as usize;
        let identity = if identity_len == 0 {
            None
        } else {
            let mut raw = vec![0u8; identity_len];
            cursor.read_exact(&mut raw).map_err(|_| CertError::Malformed)?;
            let text = String::from_utf8(raw).map_err(|_| CertError::BadIdentity)?;
            Some(Identity::from_str(&text).map_err(|_| CertError::BadIdentity)?)
        };

        let app_count = cursor.read_u8().map_err(|_| CertError::Malformed)? as usize;
        let mut app_ids = Vec::with_capacity(app_count);
        for _ in 0..app_count {
            app_ids.push(cursor.read_u32::<LittleEndian>().map_err(|_| CertError::Malformed)?);
        }
        let pop_count = cursor.read_u8().map_err(|_| CertError::Malformed)? as usize;
        let mut pop_ids = Vec::with_capacity(pop_count);
        for _ in 0..pop_count {
            pop_ids.push(PopId(cursor.read_u32::<LittleEndian>().map_err(|_| CertError::Malformed)?));
        }
        let time_created = cursor.read_u64::<LittleEndian>().map_err(|_| CertError::Malformed)?;
        let time_expiry = cursor.read_u64::<LittleEndian>().map_err(|_| CertError::Malformed)?;

        Ok(Cert {
            key_type,
            public_key,
            identity,
            app_ids,
            pop_ids,
            time_created,
            time_expiry,
        })
    }
}

/// A cert as transmitted: the serialized cert plus the CA signature over it.
/// An empty signature marks a self-signed cert; the cert's own key must then
/// have signed it out of band (or the peer policy must allow unsigned certs).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedCert {
    pub cert_bytes: Vec<u8>,
    pub ca_key_id: u64,
    pub signature: Vec<u8>,
}

impl SignedCert {
    #[inline]
    pub fn is_ca_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn parse_cert(&self) -> CertResult<Cert> {
        Cert::parse(&self.cert_bytes)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.cert_bytes.len() + SIGNATURE_SIZE + 16);
        out.write_u32::<LittleEndian>(self.cert_bytes.len() as u32).expect("vec write");
        out.write_all(&self.cert_bytes).expect("vec write");
        out.write_u64::<LittleEndian>(self.ca_key_id).expect("vec write");
        out.write_u8(self.signature.len() as u8).expect("vec write");
        out.write_all(&self.signature).expect("vec write");
        out
    }

    pub fn parse(bytes: &[u8]) -> CertResult<SignedCert> {
        let mut cursor = Cursor::new(bytes);
        let cert_len = cursor.read_u32::<LittleEndian>().map_err(|_| CertError::Malformed)? as usize;
        if cert_len > bytes.len() {
            return Err(CertError::Malformed);
        }
        let mut cert_bytes = vec![0u8; cert_len];
        cursor.read_exact(&mut cert_bytes).map_err(|_| CertError::Malformed)?;
        let ca_key_id = cursor.read_u64::<LittleEndian>().map_err(|_| CertError::Malformed)?;
        let sig_len = cursor.read_u8().map_err(|_| CertError::Malformed)? as usize;
        if sig_len != 0 && sig_len != SIGNATURE_SIZE {
            return Err(CertError::Malformed);
        }
        let mut signature = vec![0u8; sig_len];
        cursor.read_exact(&mut signature).map_err(|_| CertError::Malformed)?;
        Ok(SignedCert {
            cert_bytes,
            ca_key_id,
            signature,
        })
    }
}

/// One dimension of an authorization scope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Scope<T: Ord> {
    None,
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord + Clone> Scope<T> {
    pub fn from_list(items: &[T]) -> Scope<T> {
        if items.is_empty() {
            Scope::None
        } else {
            Scope::Only(items.iter().cloned().collect())
        }
    }

    pub fn allows(&self, item: &T) -> bool {
        match self {
            Scope::None => false,
            Scope::All => true,
            Scope::Only(set) => set.contains(item),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Scope::None)
    }

    pub fn intersect(&self, other: &Scope<T>) -> Scope<T> {
        match (self, other) {
            (Scope::None, _) | (_, Scope::None) => Scope::None,
            (Scope::All, other) => other.clone(),
            (this, Scope::All) => this.clone(),
            (Scope::Only(a), Scope::Only(b)) => {
                let common: BTreeSet<T> = a.intersection(b).cloned().collect();
                if common.is_empty() {
                    Scope::None
                } else {
                    Scope::Only(common)
                }
            }
        }
    }

    /// Intersection where an empty claimed list inherits the granting scope.
    fn restrict(&self, claimed: &[T]) -> Scope<T> {
        if claimed.is_empty() {
            self.clone()
        } else {
            self.intersect(&Scope::from_list(claimed))
        }
    }
}

/// The rights a verified cert chain grants.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthScope {
    pub apps: Scope<u32>,
    pub pops: Scope<PopId>,
    pub expiry: u64,
}

impl AuthScope {
    pub fn all(expiry: u64) -> AuthScope {
        AuthScope {
            apps: Scope::All,
            pops: Scope::All,
            expiry,
        }
    }
}

/// Config-file form of a root of trust: a base64 public key and the scope
/// it is granted. Empty lists grant everything; a missing expiry never
/// expires.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootKeyConfig {
    #[serde(with = "crate::encoding::base64")]
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub apps: Vec<u32>,
    #[serde(default)]
    pub pops: Vec<String>,
    #[serde(default)]
    pub expiry: Option<u64>,
}

struct TrustedKey {
    public_key: SigningPublicKey,
    scope: AuthScope,
    signed_by: Option<u64>,
}

/// Registry of trusted signing keys. Root keys are installed directly;
/// intermediate keys enter via certs signed by keys already in the store.
/// Trust chains are resolved iteratively, with an explicit in-progress set so
/// a crafted loop of signatures is reported instead of recursed into.
pub struct CertStore {
    keys: HashMap<u64, TrustedKey>,
    revoked: HashSet<u64>,
}

impl Default for CertStore {
    fn default() -> CertStore {
        CertStore::new()
    }
}

impl CertStore {
    pub fn new() -> CertStore {
        CertStore {
            keys: HashMap::new(),
            revoked: HashSet::new(),
        }
    }

    /// Installs a root of trust with the given scope.
    pub fn add_root_key(&mut self, public_key: SigningPublicKey, scope: AuthScope) -> u64 {
        let key_id = public_key.key_id();
        self.keys.insert(
            key_id,
            TrustedKey {
                public_key,
                scope,
                signed_by: None,
            },
        );
        key_id
    }

    /// Installs a root key from its config-file form.
    pub fn add_root_key_config(&mut self, config: &RootKeyConfig) -> CertResult<u64> {
        let key_bytes: [u8; PUBLIC_KEY_SIZE] = config
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| CertError::Malformed)?;
        let public_key = SigningPublicKey::from_bytes(&key_bytes).ok_or(CertError::Malformed)?;
        let mut pops = Vec::with_capacity(config.pops.len());
        for code in &config.pops {
            pops.push(PopId::from_code(code).ok_or(CertError::Malformed)?);
        }
        let scope = AuthScope {
            apps: if config.apps.is_empty() {
                Scope::All
            } else {
                Scope::from_list(&config.apps)
            },
            pops: if pops.is_empty() {
                Scope::All
            } else {
                Scope::from_list(&pops)
            },
            expiry: config.expiry.unwrap_or(u64::MAX),
        };
        Ok(self.add_root_key(public_key, scope))
    }

    /// Adds an intermediate key carried in a cert signed by a key already in
    /// the store. Returns the new key's id.
    pub fn add_cert(&mut self, signed: &SignedCert, now: u64) -> CertResult<u64> {
        let scope = self.verify(signed, now)?;
        let cert = signed.parse_cert()?;
        if cert.key_type != KeyType::Ed25519 {
            return Err(CertError::BadKeyType);
        }
        let public_key = SigningPublicKey::from_bytes(&cert.public_key).ok_or(CertError::Malformed)?;
        let key_id = public_key.key_id();
        self.keys.insert(
            key_id,
            TrustedKey {
                public_key,
                scope,
                signed_by: Some(signed.ca_key_id),
            },
        );
        Ok(key_id)
    }

    pub fn add_cert_base64(&mut self, text: &str, now: u64) -> CertResult<u64> {
        let bytes = encoding::base64::decode(text).map_err(|_| CertError::Malformed)?;
        let signed = SignedCert::parse(&bytes)?;
        self.add_cert(&signed, now)
    }

    pub fn add_revocation(&mut self, key_id: u64) {
        self.revoked.insert(key_id);
    }

    pub fn reset(&mut self) {
        self.keys.clear();
        self.revoked.clear();
    }

    /// Evaluates the CA trust chain for a signed cert and returns the scope
    /// it grants. This is the `verify(cert_chain, now) -> AuthScope` entry
    /// point the connection handshake consumes.
    pub fn verify(&self, signed: &SignedCert, now: u64) -> CertResult<AuthScope> {
        if !signed.is_ca_signed() {
            return Err(CertError::UnknownCa);
        }
        let chain_scope = self.resolve_chain_scope(signed.ca_key_id)?;

        let ca = self.keys.get(&signed.ca_key_id).ok_or(CertError::UnknownCa)?;
        if !ca.public_key.verify(&signed.cert_bytes, &signed.signature) {
            return Err(CertError::BadSignature);
        }

        let cert = signed.parse_cert()?;
        if self.revoked.contains(&crypto::key_id_for_public_key(&cert.public_key)) {
            return Err(CertError::Revoked);
        }
        if now < cert.time_created {
            return Err(CertError::NotYetValid);
        }
        if now > cert.time_expiry || now > chain_scope.expiry {
            return Err(CertError::Expired);
        }

        Ok(AuthScope {
            apps: chain_scope.apps.restrict(&cert.app_ids),
            pops: chain_scope.pops.restrict(&cert.pop_ids),
            expiry: chain_scope.expiry.min(cert.time_expiry),
        })
    }

    /// Walks `signed_by` links up to a root, intersecting scopes. Keys seen
    /// along the walk are marked in-progress; revisiting one is a cycle.
    fn resolve_chain_scope(&self, key_id: u64) -> CertResult<AuthScope> {
        let mut in_progress: HashSet<u64> = HashSet::new();
        let mut scope: Option<AuthScope> = None;
        let mut current = Some(key_id);

        while let Some(id) = current {
            if !in_progress.insert(id) {
                return Err(CertError::TrustCycle);
            }
            if self.revoked.contains(&id) {
                return Err(CertError::Revoked);
            }
            let key = self.keys.get(&id).ok_or(CertError::UnknownCa)?;
            scope = Some(match scope {
                None => key.scope.clone(),
                Some(acc) => AuthScope {
                    apps: acc.apps.intersect(&key.scope.apps),
                    pops: acc.pops.intersect(&key.scope.pops),
                    expiry: acc.expiry.min(key.scope.expiry),
                },
            });
            current = key.signed_by;
        }

        scope.ok_or(CertError::UnknownCa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningPrivateKey;
    use crate::time::timestamp_secs;

    fn make_cert(key: &SigningPrivateKey, identity: Option<Identity>, apps: &[u32], pops: &[&str]) -> Cert {
        let now = timestamp_secs();
        Cert {
            key_type: KeyType::Ed25519,
            public_key: *key.public_key().as_bytes(),
            identity,
            app_ids: apps.to_vec(),
            pop_ids: pops.iter().map(|p| PopId::from_code(p).unwrap()).collect(),
            time_created: now - 60,
            time_expiry: now + 3600,
        }
    }

    fn sign(cert: &Cert, ca: &SigningPrivateKey) -> SignedCert {
        let cert_bytes = cert.serialize();
        let signature = ca.sign(&cert_bytes).to_vec();
        SignedCert {
            cert_bytes,
            ca_key_id: ca.public_key().key_id(),
            signature,
        }
    }

    #[test]
    fn test_pop_id_roundtrip() {
        let pop = PopId::from_code("fra").unwrap();
        assert_eq!(pop.to_string(), "fra");
        assert_eq!(PopId::from_code("iad9").unwrap().to_string(), "iad9");
        assert!(PopId::from_code("").is_none());
        assert!(PopId::from_code("tokyo").is_none());
    }

    #[test]
    fn test_cert_serialize_parse() {
        let key = SigningPrivateKey::generate();
        let cert = make_cert(&key, Some(Identity::Named("svc".into())), &[440, 570], &["fra", "iad"]);
        let parsed = Cert::parse(&cert.serialize()).unwrap();
        assert_eq!(parsed, cert);
    }

    #[test]
    fn test_signed_cert_serialize_parse() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let signed = sign(&make_cert(&leaf, None, &[440], &["fra"]), &ca);
        let parsed = SignedCert::parse(&signed.serialize()).unwrap();
        assert_eq!(parsed, signed);
    }

    #[test]
    fn test_cert_parse_err_truncated() {
        let key = SigningPrivateKey::generate();
        let bytes = make_cert(&key, None, &[440], &[]).serialize();
        assert_eq!(Cert::parse(&bytes[..bytes.len() - 1]), Err(CertError::Malformed));
    }

    #[test]
    fn test_verify_ok_and_scope() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));

        let signed = sign(&make_cert(&leaf, None, &[440], &["fra"]), &ca);
        let scope = store.verify(&signed, timestamp_secs()).unwrap();
        assert!(scope.apps.allows(&440));
        assert!(!scope.apps.allows(&570));
        assert!(scope.pops.allows(&PopId::from_code("fra").unwrap()));
        assert!(!scope.pops.allows(&PopId::from_code("iad").unwrap()));
    }

    #[test]
    fn test_verify_err_unknown_ca() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let store = CertStore::new();
        let signed = sign(&make_cert(&leaf, None, &[440], &[]), &ca);
        assert_eq!(store.verify(&signed, timestamp_secs()), Err(CertError::UnknownCa));
    }

    #[test]
    fn test_verify_err_bad_signature() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));

        let mut signed = sign(&make_cert(&leaf, None, &[440], &[]), &ca);
        signed.signature[10] ^= 1;
        assert_eq!(store.verify(&signed, timestamp_secs()), Err(CertError::BadSignature));
    }

    #[test]
    fn test_verify_err_expired() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));

        let mut cert = make_cert(&leaf, None, &[440], &[]);
        cert.time_expiry = cert.time_created + 1;
        let signed = sign(&cert, &ca);
        assert_eq!(store.verify(&signed, timestamp_secs() + 7200), Err(CertError::Expired));
    }

    #[test]
    fn test_verify_err_revoked() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));
        store.add_revocation(leaf.public_key().key_id());

        let signed = sign(&make_cert(&leaf, None, &[440], &[]), &ca);
        assert_eq!(store.verify(&signed, timestamp_secs()), Err(CertError::Revoked));
    }

    #[test]
    fn test_chain_scope_intersection() {
        let root = SigningPrivateKey::generate();
        let intermediate = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let now = timestamp_secs();

        let mut store = CertStore::new();
        store.add_root_key(root.public_key(), AuthScope::all(u64::MAX));

        // Root limits the intermediate to apps {440, 570}.
        let inter_signed = sign(&make_cert(&intermediate, None, &[440, 570], &[]), &root);
        store.add_cert(&inter_signed, now).unwrap();

        // The leaf claims {570, 730}; only 570 survives the chain.
        let leaf_signed = sign(&make_cert(&leaf, None, &[570, 730], &[]), &intermediate);
        let scope = store.verify(&leaf_signed, now).unwrap();
        assert!(scope.apps.allows(&570));
        assert!(!scope.apps.allows(&440));
        assert!(!scope.apps.allows(&730));
    }

    #[test]
    fn test_scope_intersect_table() {
        let all: Scope<u32> = Scope::All;
        let none: Scope<u32> = Scope::None;
        let some = Scope::from_list(&[1, 2]);
        assert_eq!(all.intersect(&some), some);
        assert_eq!(some.intersect(&none), Scope::None);
        assert_eq!(some.intersect(&Scope::from_list(&[2, 3])), Scope::from_list(&[2]));
        assert_eq!(some.intersect(&Scope::from_list(&[3, 4])), Scope::None);
    }

    #[test]
    fn test_reset_clears_trust() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));
        let signed = sign(&make_cert(&leaf, None, &[440], &[]), &ca);
        assert!(store.verify(&signed, timestamp_secs()).is_ok());
        store.reset();
        assert_eq!(store.verify(&signed, timestamp_secs()), Err(CertError::UnknownCa));
    }

    #[test]
    fn test_root_key_config_json() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let json = format!(
            r#"{{"public_key":"{}","apps":[440],"pops":["fra"]}}"#,
            encoding::base64::encode(ca.public_key().as_bytes()),
        );
        let config: RootKeyConfig = serde_json::from_str(&json).unwrap();

        let mut store = CertStore::new();
        store.add_root_key_config(&config).unwrap();
        let signed = sign(&make_cert(&leaf, None, &[440], &["fra"]), &ca);
        let scope = store.verify(&signed, timestamp_secs()).unwrap();
        assert!(scope.apps.allows(&440));
        assert!(!scope.apps.allows(&570));

        // The config round-trips back through text form.
        let text = serde_json::to_string(&config).unwrap();
        let reparsed: RootKeyConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed.public_key, config.public_key);
        assert_eq!(reparsed.apps, config.apps);
        assert_eq!(reparsed.pops, config.pops);
    }

    #[test]
    fn test_root_key_config_defaults_grant_all() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let json = format!(
            r#"{{"public_key":"{}"}}"#,
            encoding::base64::encode(ca.public_key().as_bytes()),
        );
        let config: RootKeyConfig = serde_json::from_str(&json).unwrap();

        let mut store = CertStore::new();
        store.add_root_key_config(&config).unwrap();
        let signed = sign(&make_cert(&leaf, None, &[570], &["iad"]), &ca);
        assert!(store.verify(&signed, timestamp_secs()).is_ok());
    }

    #[test]
    fn test_root_key_config_err_bad_key_length() {
        let config = RootKeyConfig {
            public_key: vec![1, 2, 3],
            apps: Vec::new(),
            pops: Vec::new(),
            expiry: None,
        };
        assert_eq!(
            CertStore::new().add_root_key_config(&config),
            Err(CertError::Malformed)
        );
    }

    #[test]
    fn test_add_cert_base64() {
        let ca = SigningPrivateKey::generate();
        let leaf = SigningPrivateKey::generate();
        let mut store = CertStore::new();
        store.add_root_key(ca.public_key(), AuthScope::all(u64::MAX));

        let signed = sign(&make_cert(&leaf, None, &[440], &[]), &ca);
        let text = encoding::base64::encode(&signed.serialize());
        let key_id = store.add_cert_base64(&text, timestamp_secs()).unwrap();
        assert_eq!(key_id, leaf.public_key().key_id());
    }
}
