//! The four orthogonal policies composed by every meta message

/// How a member is referenced in the authentication fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEncoding {
    /// 20-byte mid, resolved against known members
    Sha1,
    /// Length-prefixed public key
    Bin,
}

/// Who signs a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authentication {
    NoAuthentication,
    Member { encoding: MemberEncoding },
    /// A fixed number of signers in order
    MultiMember { count: u8, encoding: MemberEncoding },
}

impl Authentication {
    /// Number of signature slots at the packet tail.
    pub fn signature_count(&self) -> usize {
        match self {
            Authentication::NoAuthentication => 0,
            Authentication::Member { .. } => 1,
            Authentication::MultiMember { count, .. } => *count as usize,
        }
    }

    pub fn encoding(&self) -> Option<MemberEncoding> {
        match self {
            Authentication::NoAuthentication => None,
            Authentication::Member { encoding } | Authentication::MultiMember { encoding, .. } => {
                Some(*encoding)
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Authentication::NoAuthentication)
    }
}

/// Who may originate a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Any member
    Public,
    /// Members holding `permit` in the timeline
    Linear,
    /// One of `policies`, switched by `dispersy-dynamic-settings`; the first is the default
    Dynamic { policies: Vec<Resolution> },
}

impl Resolution {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Resolution::Dynamic { .. })
    }

    /// The policy in effect for a dynamic index, or `self` when not dynamic.
    pub fn resolve(&self, index: Option<u8>) -> Option<&Resolution> {
        match (self, index) {
            (Resolution::Dynamic { policies }, Some(index)) => policies.get(index as usize),
            (Resolution::Dynamic { .. }, None) => None,
            (policy, _) => Some(policy),
        }
    }
}

/// Order in which synced messages are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    /// Database representation: 1 for ASC, -1 for DESC.
    pub fn as_i8(self) -> i8 {
        match self {
            Direction::Asc => 1,
            Direction::Desc => -1,
        }
    }
}

/// Whether and how a message is stored and gossiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Not stored, not gossiped
    Direct,
    /// Stored and gossiped, optionally with a per-member sequence number
    FullSync {
        enable_sequence_number: bool,
        direction: Direction,
    },
    /// Only the newest `history_size` messages per (member, cluster) are kept.
    /// Cluster 0 counts the meta message on its own.
    LastSync {
        history_size: u16,
        cluster: u8,
        direction: Direction,
    },
}

impl Distribution {
    pub fn is_synced(&self) -> bool {
        !matches!(self, Distribution::Direct)
    }

    pub fn has_sequence_number(&self) -> bool {
        matches!(
            self,
            Distribution::FullSync {
                enable_sequence_number: true,
                ..
            }
        )
    }

    pub fn direction(&self) -> Direction {
        match self {
            Distribution::Direct => Direction::Asc,
            Distribution::FullSync { direction, .. } | Distribution::LastSync { direction, .. } => {
                *direction
            }
        }
    }

    pub fn cluster(&self) -> u8 {
        match self {
            Distribution::LastSync { cluster, .. } => *cluster,
            _ => 0,
        }
    }
}

/// Where a message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Explicit candidate addresses
    Candidate,
    /// The current addresses of specific members
    Member,
    /// Up to `node_count` random candidates
    Community { node_count: u8 },
    /// Up to `node_count` candidates whose member is in my subjective set
    Subjective { cluster: u8, node_count: u8 },
}
