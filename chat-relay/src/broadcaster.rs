use std::sync::Arc;

use tracing::debug;

use crate::{
    protocol::{attributed_line, echo_line, encode_membership},
    registry::Registry,
    session::Session,
};

/// Outcome of one fan-out. Each member is counted exactly once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans lines out to every registered session.
///
/// Delivery is best-effort: a line counts as delivered once it is queued for
/// the recipient. A recipient whose queue is full or closed is logged and
/// skipped, and the remaining recipients still get the line. There is no
/// retry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Relays `body` to every member: `You: body` to the sender, and
    /// `sender_name: body` to everyone else.
    pub async fn broadcast(&self, sender: &Session, sender_name: &str, body: &str) -> Delivery {
        let echo = echo_line(body);
        let attributed = attributed_line(sender_name, body);

        let mut delivery = Delivery::default();
        for member in self.registry.snapshot().await {
            let line = if member.id() == sender.id() {
                &echo
            } else {
                &attributed
            };
            deliver(&member, line, &mut delivery).await;
        }
        delivery
    }

    /// Sends the current membership record to every member.
    ///
    /// The record and its recipients come from the same snapshot.
    pub async fn broadcast_membership(&self) -> Delivery {
        let members = self.registry.snapshot().await;
        let record = encode_membership(members.iter().filter_map(|member| member.username()));

        let mut delivery = Delivery::default();
        for member in &members {
            deliver(member, &record, &mut delivery).await;
        }
        delivery
    }
}

async fn deliver(member: &Session, line: &str, delivery: &mut Delivery) {
    match member.push(line).await {
        Ok(()) => delivery.delivered += 1,
        Err(error) => {
            debug!(session = member.id(), %error, "skipping recipient");
            delivery.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::session::{
        SessionId,
        tests::{BrokenPipe, named_session, pipe_session, wait_until_closed},
    };

    async fn joined(
        registry: &Registry,
        id: SessionId,
        name: &str,
    ) -> (Arc<Session>, BufReader<DuplexStream>) {
        let (session, mut reader, client) = pipe_session(id);
        let mut client = BufReader::new(client);
        client
            .get_mut()
            .write_all(format!("{name}\n").as_bytes())
            .await
            .expect("send username");
        session.handshake(&mut reader).await.expect("handshake");
        let mut prompt = String::new();
        client.read_line(&mut prompt).await.expect("read prompt");
        registry.add(Arc::clone(&session)).await;
        (session, client)
    }

    async fn next_line(client: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        client.read_line(&mut line).await.expect("read line");
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn sender_sees_echo_and_others_see_attribution() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = joined(&registry, 1, "alice").await;
        let (_bob, mut bob_rx) = joined(&registry, 2, "bob").await;
        let (_carol, mut carol_rx) = joined(&registry, 3, "carol").await;
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let delivery = broadcaster.broadcast(&alice, "alice", "hello").await;
        assert_eq!(delivery, Delivery { delivered: 3, failed: 0 });

        assert_eq!(next_line(&mut alice_rx).await, "You: hello");
        assert_eq!(next_line(&mut bob_rx).await, "alice: hello");
        assert_eq!(next_line(&mut carol_rx).await, "alice: hello");
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_the_rest() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = joined(&registry, 1, "alice").await;
        let (broken, _) = Session::open(2, None, tokio::io::empty(), BrokenPipe);
        broken.push("warm-up").await.expect("queued before the write fails");
        wait_until_closed(&broken).await;
        registry.add(broken).await;
        let (_carol, mut carol_rx) = joined(&registry, 3, "carol").await;
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let delivery = broadcaster.broadcast(&alice, "alice", "still here").await;
        assert_eq!(delivery, Delivery { delivered: 2, failed: 1 });

        assert_eq!(next_line(&mut alice_rx).await, "You: still here");
        assert_eq!(next_line(&mut carol_rx).await, "alice: still here");
    }

    #[tokio::test]
    async fn sender_outside_registry_only_reaches_members() {
        let registry = Arc::new(Registry::new());
        let (_bob, mut bob_rx) = joined(&registry, 2, "bob").await;
        let ghost = named_session(9, "ghost");
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let delivery = broadcaster.broadcast(&ghost, "ghost", "boo").await;
        assert_eq!(delivery, Delivery { delivered: 1, failed: 0 });
        assert_eq!(next_line(&mut bob_rx).await, "ghost: boo");
    }

    #[tokio::test]
    async fn membership_lists_named_members_in_join_order() {
        let registry = Arc::new(Registry::new());
        let (_alice, mut alice_rx) = joined(&registry, 1, "alice").await;
        let (_anon, mut anon_rx) = joined(&registry, 2, "").await;
        let (_bob, mut bob_rx) = joined(&registry, 3, "bob").await;
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let delivery = broadcaster.broadcast_membership().await;
        assert_eq!(delivery, Delivery { delivered: 3, failed: 0 });

        for client in [&mut alice_rx, &mut anon_rx, &mut bob_rx] {
            assert_eq!(next_line(client).await, "MEMBERS:alice,bob,");
        }
    }

    #[tokio::test]
    async fn membership_of_empty_registry_reaches_nobody() {
        let broadcaster = Broadcaster::new(Arc::new(Registry::new()));
        assert_eq!(broadcaster.broadcast_membership().await, Delivery::default());
    }
}
