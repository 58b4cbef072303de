use {
    bitcoin::block::{self, Header},
    derive_more::Display,
    serde::{
        Deserialize, Serialize,
        de::{self, Deserializer},
    },
    serde_json::Value,
    snafu::{ResultExt, Snafu},
    std::fmt,
};

#[cfg(feature = "client")]
use {
    async_trait::async_trait,
    std::{path::Path, sync::Arc, time::Duration},
};

pub mod error;
pub mod server_addr;
pub mod timeouts;
pub mod validate;
pub mod wire;

#[cfg(feature = "client")]
pub mod certs;
#[cfg(feature = "client")]
pub mod collab;
#[cfg(feature = "client")]
pub mod framing;
#[cfg(feature = "client")]
pub mod interface;
#[cfg(feature = "client")]
pub mod resolver;
#[cfg(feature = "client")]
pub mod session;

pub use error::{PeerError, Result};
pub use server_addr::{Protocol, ServerAddr};
pub use timeouts::NetworkTimeout;
pub use wire::{Id, JsonRpcError, Message};

#[cfg(feature = "client")]
pub use {
    certs::CertPolicy,
    collab::{BlockchainStore, ChainId, ConfigProvider, EventBus, NetworkSupervisor, ProxyConfig},
    interface::Interface,
    resolver::ChainResolutionMode,
    session::NotificationSession,
};

/// Network-wide constants (see spec "Configuration inputs").
pub const CHUNK_SIZE: u32 = 2016;
pub const HEADER_SIZE: usize = 80;

/// 80-byte raw header bytes, decoded on demand via `bitcoin::consensus`.
pub type HeaderBytes = [u8; HEADER_SIZE];

/// A parsed header together with the height it was claimed at. `bitcoin`'s
/// `block::Header` already gives us the 80-byte consensus encode/decode for
/// free (it is a teacher dependency used the same way in the root binary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRecord {
    pub height: u32,
    pub header: block::Header,
}

impl HeaderRecord {
    pub fn from_bytes(height: u32, bytes: &HeaderBytes) -> Result<Self> {
        use bitcoin::consensus::Decodable;
        let header = block::Header::consensus_decode(&mut &bytes[..])
            .map_err(|e| PeerError::corrupted(format!("malformed header at height {height}: {e}")))?;
        Ok(Self { height, header })
    }

    pub fn to_bytes(&self) -> HeaderBytes {
        use bitcoin::consensus::Encodable;
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.header
            .consensus_encode(&mut buf)
            .expect("encoding a fixed-size header into a Vec cannot fail");
        buf.try_into().expect("bitcoin::block::Header is always 80 bytes")
    }
}
