//! Meta messages: named message kinds composed of four policies
//!
//! # Compatibility
//!
//! The constructor rejects policy combinations that cannot work:
//!
//! | rule | reason |
//! |------|--------|
//! | no-authentication ⇒ public, direct, candidate/member/community | nothing to check or store |
//! | linear/dynamic resolution ⇒ member authentication | permissions belong to a signer |
//! | sequence numbers ⇒ single member authentication | a missing co-signature would leave a gap |
//! | subjective destination ⇒ synced and authenticated | the set belongs to the author |
//!
//! Wire ids 235..=254 belong to the built-in Dispersy messages, 255 is never used.

use super::policy::{
    Authentication, Destination, Direction, Distribution, MemberEncoding, Resolution,
};

/// Lowest wire id reserved for Dispersy messages
pub const FIRST_RESERVED_ID: u8 = 235;
/// Wire id that may never be assigned
pub const FORBIDDEN_ID: u8 = 255;
/// Messages below this priority are only fetched on demand, never synced
pub const SYNC_PRIORITY_THRESHOLD: u8 = 32;
/// Default priority of application messages
pub const DEFAULT_PRIORITY: u8 = 128;

/// Errors when defining meta messages or conversions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaMessageError {
    EmptyName,
    /// The four policies violate the compatibility matrix
    Incompatible { name: String, rule: &'static str },
    /// An application message tried to use a Dispersy wire id
    ReservedWireId(u8),
    ForbiddenWireId,
    DuplicateWireId(u8),
    DuplicateName(String),
    UnknownName(String),
}

impl std::fmt::Display for MetaMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaMessageError::EmptyName => write!(f, "meta message name is empty"),
            MetaMessageError::Incompatible { name, rule } => {
                write!(f, "meta message {} violates: {}", name, rule)
            }
            MetaMessageError::ReservedWireId(id) => write!(f, "wire id {} is reserved", id),
            MetaMessageError::ForbiddenWireId => write!(f, "wire id 255 is forbidden"),
            MetaMessageError::DuplicateWireId(id) => write!(f, "wire id {} assigned twice", id),
            MetaMessageError::DuplicateName(name) => write!(f, "meta message {} defined twice", name),
            MetaMessageError::UnknownName(name) => write!(f, "unknown meta message {}", name),
        }
    }
}

impl std::error::Error for MetaMessageError {}

/// The built-in Dispersy messages and their wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispersyMessage {
    MissingSequence = 254,
    MissingProof = 253,
    SignatureRequest = 252,
    SignatureResponse = 251,
    PunctureRequest = 250,
    Puncture = 249,
    Identity = 248,
    MissingIdentity = 247,
    IntroductionRequest = 246,
    IntroductionResponse = 245,
    DestroyCommunity = 244,
    Authorize = 243,
    Revoke = 242,
    SubjectiveSet = 241,
    MissingSubjectiveSet = 240,
    MissingMessage = 239,
    UndoOwn = 238,
    UndoOther = 237,
    DynamicSettings = 236,
    MissingLastMessage = 235,
}

impl DispersyMessage {
    pub const ALL: [DispersyMessage; 20] = [
        DispersyMessage::MissingSequence,
        DispersyMessage::MissingProof,
        DispersyMessage::SignatureRequest,
        DispersyMessage::SignatureResponse,
        DispersyMessage::PunctureRequest,
        DispersyMessage::Puncture,
        DispersyMessage::Identity,
        DispersyMessage::MissingIdentity,
        DispersyMessage::IntroductionRequest,
        DispersyMessage::IntroductionResponse,
        DispersyMessage::DestroyCommunity,
        DispersyMessage::Authorize,
        DispersyMessage::Revoke,
        DispersyMessage::SubjectiveSet,
        DispersyMessage::MissingSubjectiveSet,
        DispersyMessage::MissingMessage,
        DispersyMessage::UndoOwn,
        DispersyMessage::UndoOther,
        DispersyMessage::DynamicSettings,
        DispersyMessage::MissingLastMessage,
    ];

    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.wire_id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            DispersyMessage::MissingSequence => "dispersy-missing-sequence",
            DispersyMessage::MissingProof => "dispersy-missing-proof",
            DispersyMessage::SignatureRequest => "dispersy-signature-request",
            DispersyMessage::SignatureResponse => "dispersy-signature-response",
            DispersyMessage::PunctureRequest => "dispersy-puncture-request",
            DispersyMessage::Puncture => "dispersy-puncture",
            DispersyMessage::Identity => "dispersy-identity",
            DispersyMessage::MissingIdentity => "dispersy-missing-identity",
            DispersyMessage::IntroductionRequest => "dispersy-introduction-request",
            DispersyMessage::IntroductionResponse => "dispersy-introduction-response",
            DispersyMessage::DestroyCommunity => "dispersy-destroy-community",
            DispersyMessage::Authorize => "dispersy-authorize",
            DispersyMessage::Revoke => "dispersy-revoke",
            DispersyMessage::SubjectiveSet => "dispersy-subjective-set",
            DispersyMessage::MissingSubjectiveSet => "dispersy-missing-subjective-set",
            DispersyMessage::MissingMessage => "dispersy-missing-message",
            DispersyMessage::UndoOwn => "dispersy-undo-own",
            DispersyMessage::UndoOther => "dispersy-undo-other",
            DispersyMessage::DynamicSettings => "dispersy-dynamic-settings",
            DispersyMessage::MissingLastMessage => "dispersy-missing-last-message",
        }
    }

    /// The meta message definition every community carries.
    pub fn meta(self) -> MetaMessage {
        use DispersyMessage as D;

        let bin = Authentication::Member {
            encoding: MemberEncoding::Bin,
        };
        let full_sync = Distribution::FullSync {
            enable_sequence_number: false,
            direction: Direction::Asc,
        };
        let broadcast = Destination::Community { node_count: 10 };

        let (authentication, resolution, distribution, destination, priority) = match self {
            D::Identity => (
                bin,
                Resolution::Public,
                Distribution::LastSync {
                    history_size: 1,
                    cluster: 0,
                    direction: Direction::Asc,
                },
                broadcast,
                64,
            ),
            D::SubjectiveSet => (
                bin,
                Resolution::Public,
                Distribution::LastSync {
                    history_size: 1,
                    cluster: 0,
                    direction: Direction::Asc,
                },
                broadcast,
                DEFAULT_PRIORITY,
            ),
            D::DestroyCommunity => (bin, Resolution::Linear, full_sync, broadcast, 192),
            D::DynamicSettings => (bin, Resolution::Linear, full_sync, broadcast, 191),
            D::Authorize | D::Revoke | D::UndoOwn => {
                (bin, Resolution::Public, full_sync, broadcast, DEFAULT_PRIORITY)
            }
            D::UndoOther => (bin, Resolution::Linear, full_sync, broadcast, DEFAULT_PRIORITY),
            D::IntroductionRequest | D::IntroductionResponse => (
                bin,
                Resolution::Public,
                Distribution::Direct,
                Destination::Candidate,
                DEFAULT_PRIORITY,
            ),
            D::SignatureRequest => (
                Authentication::NoAuthentication,
                Resolution::Public,
                Distribution::Direct,
                Destination::Member,
                DEFAULT_PRIORITY,
            ),
            D::MissingSequence
            | D::MissingProof
            | D::SignatureResponse
            | D::PunctureRequest
            | D::Puncture
            | D::MissingIdentity
            | D::MissingSubjectiveSet
            | D::MissingMessage
            | D::MissingLastMessage => (
                Authentication::NoAuthentication,
                Resolution::Public,
                Distribution::Direct,
                Destination::Candidate,
                DEFAULT_PRIORITY,
            ),
        };

        MetaMessage {
            name: self.name().to_string(),
            kind: MetaKind::Dispersy(self),
            database_id: 0,
            authentication,
            resolution,
            distribution,
            destination,
            priority,
            undo_callback: false,
        }
    }
}

/// Whether a meta message is built in or defined by the community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Dispersy(DispersyMessage),
    Application,
}

/// A message kind within a community.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMessage {
    pub name: String,
    pub kind: MetaKind,
    /// Persistent id, assigned when the community registers the meta
    pub database_id: i64,
    pub authentication: Authentication,
    pub resolution: Resolution,
    pub distribution: Distribution,
    pub destination: Destination,
    /// 0..=255, below 32 is never synced
    pub priority: u8,
    /// Whether the community wants `undo_message` for this kind
    pub undo_callback: bool,
}

impl MetaMessage {
    /// Define an application message, enforcing the compatibility matrix.
    pub fn new(
        name: impl Into<String>,
        authentication: Authentication,
        resolution: Resolution,
        distribution: Distribution,
        destination: Destination,
    ) -> Result<Self, MetaMessageError> {
        let meta = MetaMessage {
            name: name.into(),
            kind: MetaKind::Application,
            database_id: 0,
            authentication,
            resolution,
            distribution,
            destination,
            priority: DEFAULT_PRIORITY,
            undo_callback: false,
        };
        meta.check_compatibility()?;
        Ok(meta)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_undo_callback(mut self) -> Self {
        self.undo_callback = true;
        self
    }

    pub fn dispersy_kind(&self) -> Option<DispersyMessage> {
        match self.kind {
            MetaKind::Dispersy(kind) => Some(kind),
            MetaKind::Application => None,
        }
    }

    pub fn is(&self, kind: DispersyMessage) -> bool {
        self.kind == MetaKind::Dispersy(kind)
    }

    /// Whether stored copies are handed out by sync responses.
    pub fn is_synced(&self) -> bool {
        self.distribution.is_synced() && self.priority >= SYNC_PRIORITY_THRESHOLD
    }

    pub fn check_compatibility(&self) -> Result<(), MetaMessageError> {
        let fail = |rule: &'static str| {
            Err(MetaMessageError::Incompatible {
                name: self.name.clone(),
                rule,
            })
        };

        if self.name.is_empty() {
            return Err(MetaMessageError::EmptyName);
        }

        match self.authentication {
            Authentication::NoAuthentication => {
                if self.resolution != Resolution::Public {
                    return fail("no-authentication requires public resolution");
                }
                if self.distribution != Distribution::Direct {
                    return fail("no-authentication requires direct distribution");
                }
                if matches!(self.destination, Destination::Subjective { .. }) {
                    return fail("no-authentication cannot use a subjective destination");
                }
            }
            Authentication::MultiMember { count, .. } => {
                if count < 2 {
                    return fail("multi-member authentication needs at least two members");
                }
                if self.distribution.has_sequence_number() {
                    return fail("multi-member authentication cannot use sequence numbers");
                }
            }
            Authentication::Member { .. } => {}
        }

        if let Resolution::Dynamic { policies } = &self.resolution {
            if policies.is_empty() || policies.len() > u8::MAX as usize {
                return fail("dynamic resolution needs between 1 and 255 policies");
            }
            if policies.iter().any(Resolution::is_dynamic) {
                return fail("dynamic resolution cannot nest");
            }
        }

        if let Distribution::LastSync { history_size, .. } = self.distribution {
            if history_size == 0 {
                return fail("last-sync history size must be at least 1");
            }
        }

        if matches!(self.destination, Destination::Subjective { .. })
            && !self.distribution.is_synced()
        {
            return fail("subjective destination requires full-sync or last-sync");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Authentication {
        Authentication::Member {
            encoding: MemberEncoding::Sha1,
        }
    }

    fn full_sync(sequence: bool) -> Distribution {
        Distribution::FullSync {
            enable_sequence_number: sequence,
            direction: Direction::Asc,
        }
    }

    #[test]
    fn test_valid_application_meta() {
        let meta = MetaMessage::new(
            "text",
            member(),
            Resolution::Public,
            full_sync(true),
            Destination::Community { node_count: 10 },
        )
        .unwrap()
        .with_priority(200);
        assert_eq!(meta.priority, 200);
        assert_eq!(meta.kind, MetaKind::Application);
        assert!(meta.is_synced());
    }

    #[test]
    fn test_no_authentication_rules() {
        let err = MetaMessage::new(
            "bad",
            Authentication::NoAuthentication,
            Resolution::Linear,
            Distribution::Direct,
            Destination::Candidate,
        )
        .unwrap_err();
        assert!(matches!(err, MetaMessageError::Incompatible { .. }));

        assert!(MetaMessage::new(
            "bad",
            Authentication::NoAuthentication,
            Resolution::Public,
            full_sync(false),
            Destination::Candidate,
        )
        .is_err());

        assert!(MetaMessage::new(
            "ok",
            Authentication::NoAuthentication,
            Resolution::Public,
            Distribution::Direct,
            Destination::Community { node_count: 3 },
        )
        .is_ok());
    }

    #[test]
    fn test_multi_member_rejects_sequence_numbers() {
        let err = MetaMessage::new(
            "record",
            Authentication::MultiMember {
                count: 2,
                encoding: MemberEncoding::Bin,
            },
            Resolution::Public,
            full_sync(true),
            Destination::Community { node_count: 10 },
        )
        .unwrap_err();
        assert!(err.to_string().contains("sequence numbers"));
    }

    #[test]
    fn test_subjective_requires_sync() {
        assert!(MetaMessage::new(
            "s",
            member(),
            Resolution::Public,
            Distribution::Direct,
            Destination::Subjective {
                cluster: 1,
                node_count: 5
            },
        )
        .is_err());
    }

    #[test]
    fn test_dynamic_policy_rules() {
        assert!(MetaMessage::new(
            "d",
            member(),
            Resolution::Dynamic { policies: vec![] },
            full_sync(false),
            Destination::Community { node_count: 1 },
        )
        .is_err());

        assert!(MetaMessage::new(
            "d",
            member(),
            Resolution::Dynamic {
                policies: vec![Resolution::Public, Resolution::Linear]
            },
            full_sync(false),
            Destination::Community { node_count: 1 },
        )
        .is_ok());
    }

    #[test]
    fn test_reserved_messages_are_compatible() {
        for kind in DispersyMessage::ALL {
            let meta = kind.meta();
            meta.check_compatibility().unwrap();
            assert!(meta.name.starts_with("dispersy-"));
            assert!(kind.wire_id() >= FIRST_RESERVED_ID && kind.wire_id() < FORBIDDEN_ID);
            assert_eq!(DispersyMessage::from_wire_id(kind.wire_id()), Some(kind));
        }
        assert_eq!(DispersyMessage::from_wire_id(FORBIDDEN_ID), None);
    }
}
