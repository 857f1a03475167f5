use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known role markers carried by relay directory entries. The flag set
/// on a node is open (directories publish more labels than these); typed
/// variants exist only for the flags the pipeline makes decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayFlag {
    Guard,
    Exit,
    Fast,
    Stable,
}

impl RelayFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayFlag::Guard => "Guard",
            RelayFlag::Exit => "Exit",
            RelayFlag::Fast => "Fast",
            RelayFlag::Stable => "Stable",
        }
    }
}

impl fmt::Display for RelayFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One known relay in the overlay directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayNode {
    pub id: i64,
    pub address: IpAddr,
    pub port: u16,
    pub fingerprint: Option<String>,
    pub nickname: Option<String>,
    /// Open set of directory flags, stored verbatim.
    pub flags: Vec<String>,
    pub country_code: Option<String>,
    pub asn: Option<String>,
    pub bandwidth: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RelayNode {
    pub fn has_flag(&self, flag: RelayFlag) -> bool {
        self.flags.iter().any(|f| f == flag.as_str())
    }
}

/// A relay record ready for upsert, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRelayNode {
    pub address: IpAddr,
    pub port: u16,
    pub fingerprint: Option<String>,
    pub nickname: Option<String>,
    pub flags: Vec<String>,
    pub country_code: Option<String>,
    pub asn: Option<String>,
    pub bandwidth: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
}
