use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Identity of a connection peer.
///
/// `LocalHost` is special: it can only be authenticated with a self-signed
/// cert, and is accepted without one. `AnonymousServer` identifies a
/// dedicated server by slot number without naming it; such peers may present
/// identity-less certs as long as the cert is scoped to a datacenter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Identity {
    LocalHost,
    Ip(SocketAddr),
    Named(String),
    AnonymousServer(u64),
}

impl Identity {
    #[inline]
    pub fn is_local_host(&self) -> bool {
        matches!(self, Identity::LocalHost)
    }

    /// Anonymous dedicated-server identities may authenticate with an
    /// identity-less, datacenter-scoped cert.
    #[inline]
    pub fn accepts_anonymous_cert(&self) -> bool {
        matches!(self, Identity::AnonymousServer(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::LocalHost => write!(f, "localhost"),
            Identity::Ip(addr) => write!(f, "ip:{}", addr),
            Identity::Named(name) => write!(f, "name:{}", name),
            Identity::AnonymousServer(slot) => write!(f, "anon-server:{}", slot),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct ParseIdentityError;

impl FromStr for Identity {
    type Err = ParseIdentityError;

    fn from_str(text: &str) -> Result<Identity, ParseIdentityError> {
        if text == "localhost" {
            return Ok(Identity::LocalHost);
        }
        if let Some(addr) = text.strip_prefix("ip:") {
            return addr.parse().map(Identity::Ip).map_err(|_| ParseIdentityError);
        }
        if let Some(name) = text.strip_prefix("name:") {
            if name.is_empty() {
                return Err(ParseIdentityError);
            }
            return Ok(Identity::Named(name.to_owned()));
        }
        if let Some(slot) = text.strip_prefix("anon-server:") {
            return slot
                .parse()
                .map(Identity::AnonymousServer)
                .map_err(|_| ParseIdentityError);
        }
        Err(ParseIdentityError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(identity: Identity) {
        let text = identity.to_string();
        assert_eq!(text.parse::<Identity>().unwrap(), identity);
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(Identity::LocalHost);
        roundtrip(Identity::Ip("10.0.0.1:27015".parse().unwrap()));
        roundtrip(Identity::Named("relay-fra#4".to_owned()));
        roundtrip(Identity::AnonymousServer(1234));
    }

    #[test]
    fn test_parse_err() {
        assert!("".parse::<Identity>().is_err());
        assert!("name:".parse::<Identity>().is_err());
        assert!("ip:not-an-addr".parse::<Identity>().is_err());
        assert!("anon-server:x".parse::<Identity>().is_err());
    }
}
