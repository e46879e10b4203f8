//! The simple community
//!
//! Carries a meta message for each interesting policy combination and
//! records what it receives so tests can look at it.

use std::any::Any;

use tracing::debug;

use crate::community::{CommunityFactory, CommunityHooks};
use crate::message::{
    Authentication, Destination, Direction, Distribution, MemberEncoding, Message, MetaMessage, MetaMessageError,
    Resolution, Verdict,
};
use crate::network::encoding::Value;
use crate::network::payload::{DestroyDegree, Payload};

/// Key of the text field in every payload
const TEXT_KEY: &str = "text";

/// Cluster shared by last-sync status messages
pub const STATUS_CLUSTER: u8 = 7;

/// Cluster of the subjective-destination message
pub const SUBJECTIVE_CLUSTER: u8 = 1;

#[derive(Debug, Default)]
pub struct SimpleCommunity {
    texts: Vec<String>,
    received: Vec<(String, String)>,
    undone: Vec<u64>,
    destroyed: Option<DestroyDegree>,
}

impl SimpleCommunity {
    pub const CLASSIFICATION: &'static str = "simple";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> CommunityFactory {
        Box::new(|| Box::new(SimpleCommunity::new()) as Box<dyn CommunityHooks>)
    }

    /// Payload of every simple community message.
    pub fn text_value(text: &str) -> Value {
        Value::dict([(Value::from(TEXT_KEY), Value::from(text))])
    }

    /// Texts of accepted `text` messages, in arrival order
    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    /// (meta name, text) of every accepted message
    pub fn received(&self) -> &[(String, String)] {
        &self.received
    }

    /// Global times of undone messages
    pub fn undone(&self) -> &[u64] {
        &self.undone
    }

    pub fn destroyed(&self) -> Option<DestroyDegree> {
        self.destroyed
    }
}

fn text_of(message: &Message) -> Option<&str> {
    match &message.payload {
        Payload::Application(value) => value.get(TEXT_KEY).and_then(Value::as_str),
        _ => None,
    }
}

impl CommunityHooks for SimpleCommunity {
    fn classification(&self) -> &'static str {
        Self::CLASSIFICATION
    }

    fn initiate_meta_messages(&self) -> Result<Vec<MetaMessage>, MetaMessageError> {
        let sha1 = Authentication::Member {
            encoding: MemberEncoding::Sha1,
        };
        let bin = Authentication::Member {
            encoding: MemberEncoding::Bin,
        };
        let full_sync = Distribution::FullSync {
            enable_sequence_number: false,
            direction: Direction::Asc,
        };
        let broadcast = Destination::Community { node_count: 10 };

        Ok(vec![
            MetaMessage::new("text", sha1, Resolution::Public, full_sync, broadcast)?,
            MetaMessage::new(
                "status",
                sha1,
                Resolution::Public,
                Distribution::LastSync {
                    history_size: 1,
                    cluster: STATUS_CLUSTER,
                    direction: Direction::Desc,
                },
                broadcast,
            )?,
            MetaMessage::new(
                "sequenced",
                sha1,
                Resolution::Public,
                Distribution::FullSync {
                    enable_sequence_number: true,
                    direction: Direction::Asc,
                },
                broadcast,
            )?,
            MetaMessage::new("moderated", bin, Resolution::Linear, full_sync, broadcast)?.with_undo_callback(),
            MetaMessage::new(
                "dynamic",
                bin,
                Resolution::Dynamic {
                    policies: vec![Resolution::Public, Resolution::Linear],
                },
                full_sync,
                broadcast,
            )?,
            MetaMessage::new(
                "subjective",
                bin,
                Resolution::Public,
                full_sync,
                Destination::Subjective {
                    cluster: SUBJECTIVE_CLUSTER,
                    node_count: 10,
                },
            )?,
        ])
    }

    fn check_message(&mut self, message: &Message) -> Verdict {
        match text_of(message) {
            Some(_) => Verdict::Accept,
            None => Verdict::drop("payload has no text"),
        }
    }

    fn on_messages(&mut self, messages: &[Message]) {
        for message in messages {
            let Some(text) = text_of(message) else {
                continue;
            };
            if message.meta.name == "text" {
                self.texts.push(text.to_string());
            }
            self.received.push((message.meta.name.clone(), text.to_string()));
        }
    }

    fn undo_message(&mut self, undone: &Message, by: &Message) {
        debug!(global_time = undone.global_time, by = by.global_time, "message undone");
        self.undone.push(undone.global_time);
    }

    fn on_destroyed(&mut self, degree: DestroyDegree) {
        self.destroyed = Some(degree);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::start::start_memory_db;
    use crate::protocol::config::DispersyConfig;
    use crate::protocol::core::Dispersy;
    use std::time::Instant;

    #[test]
    fn test_meta_messages_are_compatible() {
        let metas = SimpleCommunity::new().initiate_meta_messages().unwrap();
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["text", "status", "sequenced", "moderated", "dynamic", "subjective"]);
        assert!(metas.iter().all(|m| m.check_compatibility().is_ok()));
        assert!(metas[3].undo_callback);
    }

    #[test]
    fn test_received_texts_recorded() {
        let now = Instant::now();
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing()).unwrap();
        let cid = d.create_community(Box::new(SimpleCommunity::new()), now).unwrap();

        // Our own messages skip the application check but are not recorded
        d.create_value_message(&cid, "text", Value::Int(3), now).unwrap();
        d.create_value_message(&cid, "status", SimpleCommunity::text_value("busy"), now)
            .unwrap();

        let hooks = d.community(&cid).unwrap().hooks_as::<SimpleCommunity>().unwrap();
        assert!(hooks.texts().is_empty());
        assert_eq!(hooks.received(), &[("status".to_string(), "busy".to_string())]);
    }
}
