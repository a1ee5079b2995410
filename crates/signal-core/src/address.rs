use std::fmt;
use std::str::FromStr;

use multiaddr::multihash::Multihash;
use multiaddr::{Multiaddr, Protocol};

use crate::error::AddressError;

/// Opaque peer identifier. Compared and hashed by bytes only; never
/// interpreted, decoded, or validated beyond non-emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(String);

impl Pid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Pid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Raw bytes wrapped as an identity-coded multihash, the standard way to
/// embed an opaque identifier (rather than a real content hash) in a
/// multiaddr `/p2p/` component.
const IDENTITY_MULTIHASH_CODE: u64 = 0x00;

fn pid_to_multihash(pid: &Pid) -> Result<Multihash<64>, AddressError> {
    Multihash::wrap(IDENTITY_MULTIHASH_CODE, pid.as_str().as_bytes())
        .map_err(|_| AddressError::MissingHostPort)
}

fn multihash_to_pid(mh: &Multihash<64>) -> Option<Pid> {
    if mh.code() != IDENTITY_MULTIHASH_CODE {
        return None;
    }
    std::str::from_utf8(mh.digest()).ok().map(Pid::from)
}

/// A node's locator, decomposed from a [`multiaddr::Multiaddr`].
///
/// Recognised components: `/ip4` or `/ip6` (host), `/tcp` (port), `/http`
/// (the "direct" marker — HTTP offer/answer is available here),
/// `/p2p-webrtc-star` (the "star" marker — signalling-overlay use), and up
/// to two `/p2p/<pid>` components: the first is the owner of the listener,
/// the second — only meaningful alongside the star marker — is a dial
/// destination PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    inner: Multiaddr,
    host: String,
    port: u16,
    is_direct: bool,
    is_star: bool,
    owner_pid: Option<Pid>,
    dest_pid: Option<Pid>,
}

impl Address {
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let inner: Multiaddr = s.parse()?;
        Self::from_multiaddr(inner)
    }

    pub fn from_multiaddr(inner: Multiaddr) -> Result<Self, AddressError> {
        let mut host = None;
        let mut port = None;
        let mut is_direct = false;
        let mut is_star = false;
        let mut pids = Vec::new();

        for proto in inner.iter() {
            match proto {
                Protocol::Ip4(addr) => host = Some(addr.to_string()),
                Protocol::Ip6(addr) => host = Some(addr.to_string()),
                Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                    host = Some(name.to_string())
                }
                Protocol::Tcp(p) => port = Some(p),
                Protocol::Http => is_direct = true,
                Protocol::P2pWebRtcStar => is_star = true,
                Protocol::P2p(mh) => {
                    if let Some(pid) = multihash_to_pid(&mh) {
                        pids.push(pid);
                    }
                }
                _ => {}
            }
        }

        let (host, port) = match (host, port) {
            (Some(host), Some(port)) => (host, port),
            _ => return Err(AddressError::MissingHostPort),
        };

        let mut pids = pids.into_iter();
        let owner_pid = pids.next();
        let dest_pid = pids.next();

        Ok(Self {
            inner,
            host,
            port,
            is_direct,
            is_star,
            owner_pid,
            dest_pid,
        })
    }

    /// Builds an address from parts, for addresses this node announces
    /// itself (e.g. a listener's own multi-address).
    pub fn build(
        host: std::net::Ipv4Addr,
        port: u16,
        is_direct: bool,
        is_star: bool,
        owner_pid: Option<&Pid>,
        dest_pid: Option<&Pid>,
    ) -> Result<Self, AddressError> {
        let mut inner = Multiaddr::empty();
        inner.push(Protocol::Ip4(host));
        inner.push(Protocol::Tcp(port));
        if is_direct {
            inner.push(Protocol::Http);
        }
        if let Some(pid) = owner_pid {
            inner.push(Protocol::P2p(pid_to_multihash(pid)?));
        }
        if is_star {
            inner.push(Protocol::P2pWebRtcStar);
        }
        if let Some(pid) = dest_pid {
            inner.push(Protocol::P2p(pid_to_multihash(pid)?));
        }
        Self::from_multiaddr(inner)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_direct(&self) -> bool {
        self.is_direct
    }

    pub fn is_star(&self) -> bool {
        self.is_star
    }

    pub fn owner_pid(&self) -> Option<&Pid> {
        self.owner_pid.as_ref()
    }

    pub fn dest_pid(&self) -> Option<&Pid> {
        self.dest_pid.as_ref()
    }

    pub fn as_multiaddr(&self) -> &Multiaddr {
        &self.inner
    }

    pub fn http_url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
