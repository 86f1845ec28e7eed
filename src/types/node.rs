use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;

/// Descriptor of a peer as the election and replication layers see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub first_public_key: PublicKey,
    pub last_public_key: PublicKey,
    pub ip: IpAddr,
    pub port: u16,
    /// Three-character geographic patch used to spread replication.
    pub geo_patch: String,
    pub authorized: bool,
    pub available: bool,
}

impl Peer {
    pub fn new(first_public_key: PublicKey, last_public_key: PublicKey, ip: IpAddr, port: u16) -> Self {
        Self {
            first_public_key,
            last_public_key,
            ip,
            port,
            geo_patch: "AAA".to_string(),
            authorized: true,
            available: true,
        }
    }
}
