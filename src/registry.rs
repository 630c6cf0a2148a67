//! Read-only view of the externally maintained participant roster.
//!
//! The roster is produced by another component on its own cadence. Each
//! [`RegistrySnapshot`] is an immutable point-in-time read; callers always join
//! against whatever snapshot is current when they ask.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StoreError;
use crate::logging::{obj, v_num, Domain, Level, Logger};
use crate::store::DurableJsonStore;
use crate::types::Identity;

/// Host value meaning "this member has not published an address".
pub const NO_ADDRESS_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn is_routable(&self) -> bool {
        !self.host.trim().is_empty() && self.host != NO_ADDRESS_HOST && self.port != 0
    }

    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://{}:{}/", self.host, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub identity: Identity,
    #[serde(default)]
    pub trust: f64,
    #[serde(default)]
    pub address: Option<Endpoint>,
}

/// On-disk roster layout written by the external registry component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterDocument {
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    members: Vec<Member>,
    index: HashMap<Identity, usize>,
}

impl RegistrySnapshot {
    /// Later duplicates of an identity are ignored; roster order is preserved.
    pub fn new(members: Vec<Member>) -> Self {
        let mut kept = Vec::with_capacity(members.len());
        let mut index = HashMap::with_capacity(members.len());
        for m in members {
            if index.contains_key(&m.identity) {
                continue;
            }
            index.insert(m.identity.clone(), kept.len());
            kept.push(m);
        }
        Self { members: kept, index }
    }

    pub fn members(&self) -> impl Iterator<Item = &Identity> {
        self.members.iter().map(|m| &m.identity)
    }

    pub fn entries(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.index.contains_key(identity)
    }

    /// Trust weight; unknown identities weigh zero.
    pub fn trust(&self, identity: &Identity) -> f64 {
        self.member(identity).map(|m| m.trust).unwrap_or(0.0)
    }

    pub fn address(&self, identity: &Identity) -> Option<&Endpoint> {
        self.member(identity).and_then(|m| m.address.as_ref())
    }

    /// Position of the identity in roster order, used as the stable tie-break.
    pub fn rank(&self, identity: &Identity) -> Option<usize> {
        self.index.get(identity).copied()
    }

    fn member(&self, identity: &Identity) -> Option<&Member> {
        self.index.get(identity).map(|&i| &self.members[i])
    }
}

impl From<RosterDocument> for RegistrySnapshot {
    fn from(doc: RosterDocument) -> Self {
        Self::new(doc.members)
    }
}

/// Anything that can hand out the latest roster snapshot.
pub trait RegistrySource: Send + Sync {
    fn snapshot(&self) -> Arc<RegistrySnapshot>;
}

/// Snapshot holder that an external refresher swaps wholesale.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl SharedRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn replace(&self, snapshot: RegistrySnapshot) {
        if let Ok(mut cur) = self.current.write() {
            *cur = Arc::new(snapshot);
        }
    }
}

impl RegistrySource for SharedRegistry {
    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(cur) => Arc::clone(&cur),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// Roster mirrored from a JSON document that the registry component rewrites.
pub struct FileRegistry {
    path: PathBuf,
    shared: SharedRegistry,
    logger: Logger,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>, logger: Logger) -> Self {
        Self {
            path: path.into(),
            shared: SharedRegistry::default(),
            logger,
        }
    }

    /// Re-read the roster document and publish it. On failure the previous
    /// snapshot stays current.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let doc: RosterDocument = DurableJsonStore::read_path(&self.path)?;
        let snapshot = RegistrySnapshot::from(doc);
        let n = snapshot.len();
        self.shared.replace(snapshot);
        self.logger.log(
            Level::Debug,
            Domain::Registry,
            "roster_reloaded",
            obj(&[("members", v_num(n as f64))]),
        );
        Ok(n)
    }
}

impl RegistrySource for FileRegistry {
    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.shared.snapshot()
    }
}

#[cfg(test)]
pub(crate) fn member(id: &str, trust: f64, port: Option<u16>) -> Member {
    Member {
        identity: Identity::new(id),
        trust,
        address: port.map(|p| Endpoint::new("10.0.0.1", p)),
    }
}
