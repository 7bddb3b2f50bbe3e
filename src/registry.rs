//! Server registry: the host-global, append-only list of known servers.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::store::{HostState, Store};

pub const DEFAULT_GROUP: &str = "default";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Base64 ed25519 public host key
    pub fingerprint: String,
}

impl ServerDefinition {
    /// Identifying fields in resolution order.
    fn identity_fields(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("ipv4", self.ipv4.as_deref()),
            ("ipv6", self.ipv6.as_deref()),
            ("hostname", self.hostname.as_deref()),
            ("uniqueId", Some(self.unique_id.as_str())),
        ]
    }

    fn has_identity(&self, value: &str) -> bool {
        self.identity_fields()
            .iter()
            .any(|(_, v)| *v == Some(value))
    }

    fn ensure_distinct_fields(&self) -> Result<()> {
        let values: Vec<&str> = self
            .identity_fields()
            .iter()
            .filter_map(|(_, v)| *v)
            .collect();
        for (i, a) in values.iter().enumerate() {
            if values[i + 1..].contains(a) {
                return Err(Error::Config(format!(
                    "Server {} has the value {} in more than one identifying field",
                    self.unique_id, a
                )));
            }
        }
        Ok(())
    }

    /// Address to SSH to: IPv6 when present, else IPv4.
    pub fn preferred_host(&self) -> Result<&str> {
        self.ipv6
            .as_deref()
            .or(self.ipv4.as_deref())
            .ok_or_else(|| {
                Error::Config(format!("Server {} has no IP address", self.unique_id))
            })
    }

    pub fn describe(&self) -> String {
        let addr = self
            .preferred_host()
            .map(str::to_string)
            .unwrap_or_else(|_| self.unique_id.clone());
        match &self.hostname {
            Some(h) => format!("{} ({})", addr, h),
            None => addr,
        }
    }
}

/// Input to [`ServerRegistry::register`]. Empty strings count as absent.
#[derive(Debug, Clone, Default)]
pub struct NewServer {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub hostname: Option<String>,
    pub group: Option<String>,
    pub fingerprint: String,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct ServerRegistry {
    store: Arc<dyn Store<HostState>>,
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn Store<HostState>>) -> Self {
        Self { store }
    }

    pub fn register(&self, new: NewServer) -> Result<(String, ServerDefinition)> {
        let ipv4 = non_empty(&new.ipv4);
        let ipv6 = non_empty(&new.ipv6);
        let hostname = non_empty(&new.hostname);
        let group = non_empty(&new.group).unwrap_or_else(|| DEFAULT_GROUP.to_string());

        if ipv4.is_none() && ipv6.is_none() {
            return Err(Error::Config(
                "Either an IPv4 or IPv6 address is required".into(),
            ));
        }
        if let Some(v4) = &ipv4 {
            v4.parse::<Ipv4Addr>()
                .map_err(|_| Error::Config(format!("Invalid IPv4 address: {}", v4)))?;
        }
        if let Some(v6) = &ipv6 {
            v6.parse::<Ipv6Addr>()
                .map_err(|_| Error::Config(format!("Invalid IPv6 address: {}", v6)))?;
        }
        if new.fingerprint.trim().is_empty() {
            return Err(Error::Config("A server needs a fingerprint".into()));
        }

        let server = ServerDefinition {
            unique_id: uuid::Uuid::new_v4().to_string(),
            ipv4,
            ipv6,
            hostname,
            fingerprint: new.fingerprint.trim().to_string(),
        };
        server.ensure_distinct_fields()?;

        let mut state = self.store.load()?;
        for existing in state.servers.values().flatten() {
            for (field, value) in server.identity_fields() {
                if let Some(value) = value {
                    if existing.has_identity(value) {
                        return Err(Error::DuplicateIdentity {
                            field,
                            value: value.to_string(),
                            existing: existing.describe(),
                        });
                    }
                }
            }
        }

        state
            .servers
            .entry(group.clone())
            .or_default()
            .push(server.clone());
        self.store.save(&state)?;

        Ok((group, server))
    }

    /// Match `key` against ipv4, ipv6, hostname, then uniqueId across all groups.
    pub fn resolve(&self, key: &str) -> Result<ServerDefinition> {
        self.locate(key).map(|(_, server)| server)
    }

    pub fn group_of(&self, key: &str) -> Result<String> {
        self.locate(key).map(|(group, _)| group)
    }

    fn locate(&self, key: &str) -> Result<(String, ServerDefinition)> {
        let state = self.store.load()?;
        for field in 0..4 {
            for (group, servers) in &state.servers {
                for server in servers {
                    if server.identity_fields()[field].1 == Some(key) {
                        server.ensure_distinct_fields()?;
                        return Ok((group.clone(), server.clone()));
                    }
                }
            }
        }
        Err(Error::ServerNotDefined(key.to_string()))
    }

    /// The only mutation a registered server ever sees.
    pub fn set_fingerprint(&self, unique_id: &str, fingerprint: &str) -> Result<()> {
        let found = self.store.update(|state| {
            for server in state.servers.values_mut().flatten() {
                if server.unique_id == unique_id {
                    server.fingerprint = fingerprint.to_string();
                    return true;
                }
            }
            false
        })?;
        if found {
            Ok(())
        } else {
            Err(Error::ServerNotDefined(unique_id.to_string()))
        }
    }

    pub fn groups(&self) -> Result<BTreeMap<String, Vec<ServerDefinition>>> {
        Ok(self.store.load()?.servers)
    }
}
