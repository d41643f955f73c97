use std::collections::HashSet;
use std::fmt;

/// Opaque identifier of a cluster member.
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed cluster membership, validated once at startup.
pub(crate) struct ClusterMembers {
    me: ReplicaId,
    peers: Vec<ReplicaId>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("local replica id '{0}' is not listed in the cluster membership")]
    MeNotInCluster(ReplicaId),
    #[error("duplicate replica id '{0}' in cluster membership")]
    DuplicateMember(ReplicaId),
}

impl ClusterMembers {
    pub(crate) fn new(me: ReplicaId, all_members: Vec<ReplicaId>) -> Result<Self, ClusterError> {
        let mut seen = HashSet::with_capacity(all_members.len());
        for member in &all_members {
            if !seen.insert(member.clone()) {
                return Err(ClusterError::DuplicateMember(member.clone()));
            }
        }
        if !seen.contains(&me) {
            return Err(ClusterError::MeNotInCluster(me));
        }

        let peers = all_members.into_iter().filter(|m| *m != me).collect();

        Ok(ClusterMembers { me, peers })
    }

    pub(crate) fn me(&self) -> &ReplicaId {
        &self.me
    }

    pub(crate) fn peers(&self) -> &[ReplicaId] {
        &self.peers
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peers.iter().cloned().collect()
    }

    pub(crate) fn contains(&self, id: &ReplicaId) -> bool {
        *id == self.me || self.peers.contains(id)
    }

    pub(crate) fn num_members(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the whole cluster, self included.
    pub(crate) fn majority(&self) -> usize {
        self.num_members() / 2 + 1
    }
}
