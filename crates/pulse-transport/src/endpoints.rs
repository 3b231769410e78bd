//! Cluster member ingress endpoints.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::transport::MemberId;

/// Mapping from member index to `host:port`, parsed from `0=host:port,1=host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressEndpoints {
    members: BTreeMap<MemberId, String>,
}

impl IngressEndpoints {
    /// Builds endpoints from explicit pairs.
    pub fn new(members: impl IntoIterator<Item = (MemberId, String)>) -> Result<Self> {
        let members: BTreeMap<_, _> = members.into_iter().collect();
        if members.is_empty() {
            return Err(TransportError::InvalidEndpoints {
                reason: "no members".to_string(),
            });
        }
        Ok(Self { members })
    }

    /// Address of a member.
    pub fn get(&self, member_id: MemberId) -> Option<&str> {
        self.members.get(&member_id).map(|s| s.as_str())
    }

    /// Member ids in ascending order.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.keys().copied().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a parsed value.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterates over `(member_id, addr)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (MemberId, &str)> {
        self.members.iter().map(|(id, addr)| (*id, addr.as_str()))
    }
}

impl FromStr for IngressEndpoints {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let mut members = BTreeMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, addr) = entry
                .split_once('=')
                .ok_or_else(|| TransportError::InvalidEndpoints {
                    reason: format!("missing '=' in '{}'", entry),
                })?;
            let id: MemberId =
                id.trim()
                    .parse()
                    .map_err(|_| TransportError::InvalidEndpoints {
                        reason: format!("bad member id '{}'", id),
                    })?;
            let addr = addr.trim();
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => {
                    return Err(TransportError::InvalidEndpoints {
                        reason: format!("bad address '{}' for member {}", addr, id),
                    })
                }
            }
            if members.insert(id, addr.to_string()).is_some() {
                return Err(TransportError::InvalidEndpoints {
                    reason: format!("duplicate member id {}", id),
                });
            }
        }
        Self::new(members)
    }
}

impl std::fmt::Display for IngressEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (id, addr) in &self.members {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", id, addr)?;
            first = false;
        }
        Ok(())
    }
}
