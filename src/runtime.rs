//! Driving a node from an asynchronous message feed.
use smol::{channel::Receiver, future, Timer};
use tracing::{debug, warn};

use crate::{error::Error, messages::RelayMessage, node::RelayNode};

enum Event {
    Message(Option<RelayMessage>),
    Deadline,
}

/// Runs a [RelayNode], feeding it messages as they arrive and polling it
/// whenever one of its tasks comes due.
pub struct Runtime {
    node: RelayNode,
}

impl Runtime {
    pub fn new(node: RelayNode) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &RelayNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut RelayNode {
        &mut self.node
    }

    pub fn into_node(self) -> RelayNode {
        self.node
    }

    async fn next_event(&self, inbound: &Receiver<RelayMessage>) -> Event {
        let message = async { Event::Message(inbound.recv().await.ok()) };
        match self.node.time_until_next_task() {
            Some(wait) => {
                let deadline = async {
                    Timer::after(wait).await;
                    Event::Deadline
                };
                future::or(message, deadline).await
            }
            None => message.await,
        }
    }

    /// Process messages until the feed closes.
    ///
    /// A message that makes the node fail is logged and skipped. Whatever
    /// applying it had changed is rolled back.
    pub async fn run(&mut self, inbound: Receiver<RelayMessage>) -> Result<(), Error> {
        loop {
            match self.next_event(&inbound).await {
                Event::Message(None) => {
                    debug!("message feed closed");
                    return Ok(());
                }
                Event::Message(Some(message)) => {
                    let hash = message.hash();
                    match self.node.handle(message) {
                        Ok(disposition) => debug!(hash = %hash, ?disposition, "handled"),
                        Err(e) => warn!(hash = %hash, error = %e, "failed to handle message"),
                    }
                }
                Event::Deadline => self.node.poll(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use elliptic_curve::Field;
    use k256::{ProjectivePoint, Scalar};
    use rand_core::OsRng;

    use crate::{
        config::RelayConfig,
        network::{ManualClock, MemoryAnchorChain, Outbox},
    };

    #[test]
    fn test_runtime_handles_feed_until_closed() {
        let anchors = MemoryAnchorChain::new();
        let outbox = Outbox::new();
        let node = RelayNode::new(
            RelayConfig::default(),
            anchors.clone(),
            outbox.clone(),
            ManualClock::new(0),
        );
        let mut runtime = Runtime::new(node);

        let (sender, receiver) = smol::channel::unbounded();
        for _ in 0..3 {
            let key = Scalar::random(&mut OsRng);
            let anchor = anchors.push((ProjectivePoint::GENERATOR * key).to_affine());
            runtime.node_mut().join(anchor, &key).unwrap();
        }
        for message in outbox.drain() {
            sender.try_send(message.clone()).unwrap();
            // Replays are harmless.
            sender.try_send(message).unwrap();
        }
        drop(sender);

        smol::block_on(runtime.run(receiver)).unwrap();
        let node = runtime.into_node();
        assert_eq!(node.state().len(), 3);
        assert_eq!(node.controlled_relays().len(), 3);
    }
}
