use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Plaintext,
    Tls,
}

impl Protocol {
    fn suffix(self) -> &'static str {
        match self {
            Self::Plaintext => "",
            Self::Tls => "s",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Canonical `(host, port, protocol)` triple identifying a remote server.
///
/// `host` is canonicalized: IPv6 literals are stored without surrounding
/// brackets. Equality and hashing are over the tuple as stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    host: String,
    port: u16,
    protocol: Protocol,
}

impl ServerAddr {
    pub fn new(host: &str, port: u16, protocol: Option<Protocol>) -> Result<Self> {
        let host = normalize_host(host)?;
        Ok(Self {
            host,
            port,
            protocol: protocol.unwrap_or(Protocol::Tls),
        })
    }

    /// Strict parse: `host:port:protocol`, splitting on the last two colons.
    /// `protocol` must be `t` (plaintext) or `s` (tls).
    pub fn from_str(s: &str) -> Result<Self> {
        let (host, port, protocol) = split_triple(s)
            .ok_or_else(|| PeerError::corrupted(format!("malformed server address: {s:?}")))?;

        let protocol = match protocol {
            "t" => Protocol::Plaintext,
            "s" => Protocol::Tls,
            other => {
                return Err(PeerError::corrupted(format!(
                    "unknown protocol letter {other:?} in {s:?}"
                )));
            }
        };

        let port: u16 = port
            .parse()
            .map_err(|_| PeerError::corrupted(format!("invalid port in {s:?}")))?;

        Self::new(host, port, Some(protocol))
    }

    /// Lenient parse used for user-supplied server strings: missing protocol
    /// defaults to tls; any other failure returns `None` instead of raising.
    pub fn from_str_with_inference(s: &str) -> Option<Self> {
        if let Some((host, port, protocol)) = split_triple(s) {
            let protocol = match protocol {
                "t" => Protocol::Plaintext,
                "s" => Protocol::Tls,
                _ => return None,
            };
            let port: u16 = port.parse().ok()?;
            return Self::new(host, port, Some(protocol)).ok();
        }

        // No trailing `:protocol` segment: try `host:port`, default to tls.
        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Self::new(host, port, Some(Protocol::Tls)).ok()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_ipv6(&self) -> bool {
        self.host.parse::<std::net::Ipv6Addr>().is_ok()
    }

    /// Display form that omits the protocol suffix for the default (tls).
    pub fn friendly_name(&self) -> String {
        let host = if self.is_ipv6() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        match self.protocol {
            Protocol::Tls => format!("{host}:{}", self.port),
            Protocol::Plaintext => format!("{host}:{}:t", self.port),
        }
    }

    /// Filesystem-safe identifier for the certificate cache path:
    /// `<host>` for hostnames/IPv4, `ipv6_<hex>` for IPv6 literals.
    pub fn cert_cache_key(&self) -> String {
        if let Ok(v6) = self.host.parse::<std::net::Ipv6Addr>() {
            format!("ipv6_{}", hex::encode(v6.octets()))
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.is_ipv6() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        write!(f, "{host}:{}:{}", self.port, self.protocol)
    }
}

fn normalize_host(host: &str) -> Result<String> {
    let stripped = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);

    if let Ok(v6) = stripped.parse::<std::net::Ipv6Addr>() {
        return Ok(v6.to_string());
    }

    if stripped.is_empty() {
        return Err(PeerError::corrupted("empty host"));
    }

    Ok(stripped.to_string())
}

/// Splits `host:port:protocol`, tolerating bracketed IPv6 hosts that
/// themselves contain colons.
fn split_triple(s: &str) -> Option<(&str, &str, &str)> {
    let (head, protocol) = s.rsplit_once(':')?;
    let (host, port) = head.rsplit_once(':')?;
    Some((host, port, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_round_trips() {
        let addr = ServerAddr::from_str("electrum.example.com:50002:s").unwrap();
        assert_eq!(ServerAddr::from_str(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn plaintext_round_trips() {
        let addr = ServerAddr::from_str("127.0.0.1:50001:t").unwrap();
        assert_eq!(addr.protocol(), Protocol::Plaintext);
        assert_eq!(ServerAddr::from_str(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn ipv6_brackets_are_stripped() {
        let addr = ServerAddr::from_str("[2001:db8::1]:50002:s").unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert!(addr.is_ipv6());
        assert_eq!(addr.to_string(), "[2001:db8::1]:50002:s");
    }

    #[test]
    fn friendly_name_hides_tls_suffix() {
        let tls = ServerAddr::from_str("example.com:50002:s").unwrap();
        assert_eq!(tls.friendly_name(), "example.com:50002");

        let plain = ServerAddr::from_str("example.com:50001:t").unwrap();
        assert_eq!(plain.friendly_name(), "example.com:50001:t");
    }

    #[test]
    fn inference_defaults_to_tls() {
        let addr = ServerAddr::from_str_with_inference("example.com:50002").unwrap();
        assert_eq!(addr.protocol(), Protocol::Tls);
    }

    #[test]
    fn inference_rejects_garbage() {
        assert!(ServerAddr::from_str_with_inference("not an address").is_none());
    }

    #[test]
    fn cert_cache_key_ipv6() {
        let addr = ServerAddr::from_str("[::1]:50002:s").unwrap();
        assert_eq!(
            addr.cert_cache_key(),
            "ipv6_00000000000000000000000000000001"
        );
    }

    #[test]
    fn equality_and_hash_are_tuple_based() {
        let a = ServerAddr::from_str("example.com:50002:s").unwrap();
        let b = ServerAddr::from_str("example.com:50002:s").unwrap();
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
