//! Admission of relays, and the distribution of their keys.
//!
//! A relay goes through these steps:
//!
//! 1. Its join is accepted, and it gets a number.
//! 2. Once enough relays have joined after it, it distributes its key
//!    sixteenths to the holders chosen for it.
//! 3. Each holder decrypts its part. A holder that can't complains, which
//!    kills the relay on the spot, since the complaint proves itself.
//! 4. If nobody complained within the response wait time, a timeout says so,
//!    and the distribution is accepted.
use tracing::{debug, info, warn};

use crate::{
    crypto::MessageHash,
    error::Error,
    messages::{KeyDistribution, KeyDistributionComplaint, RelayJoin, RelayMessage, Signed},
    node::RelayNode,
    relay::{HolderGroup, RelayNumber},
    scheduler::Task,
    store::MessageStoreExt,
};

impl RelayNode {
    pub(crate) fn on_relay_join(
        &mut self,
        hash: MessageHash,
        join: Signed<RelayJoin>,
    ) -> Result<(), Error> {
        let number = self.state.process_relay_join(hash, &join.content)?;
        info!(relay = %number, hash = %hash, "relay admitted");
        Ok(())
    }

    /// Send out the key sixteenths of a relay this node controls.
    pub fn distribute_keys(
        &mut self,
        relay: RelayNumber,
        encoding_anchor: MessageHash,
    ) -> Result<RelayMessage, Error> {
        let sharer = self
            .state
            .relay(relay)
            .ok_or(Error::MissingKeyMaterial(relay))?;
        let content = KeyDistribution::generate(sharer, encoding_anchor, &self.state, &*self.keys)?;
        self.publish_as(relay, content)
    }

    pub(crate) fn on_key_distribution(
        &mut self,
        hash: MessageHash,
        distribution: Signed<KeyDistribution>,
    ) -> Result<(), Error> {
        let distribution = distribution.content;
        self.state.process_key_distribution(hash, &distribution)?;
        self.schedule(Task::KeyDistributionWindowClosed(hash));
        debug!(relay = %distribution.relay_number, hash = %hash, "key distribution received");
        self.open_key_sixteenths(hash, &distribution);
        Ok(())
    }

    /// Decrypt the key sixteenths sent to the relays this node controls,
    /// complaining about every one that doesn't open.
    fn open_key_sixteenths(&mut self, hash: MessageHash, distribution: &KeyDistribution) {
        let Some(sharer) = self.state.relay(distribution.relay_number).cloned() else {
            return;
        };
        let mut unopened = Vec::new();
        for group in HolderGroup::ALL {
            for (position, encrypted) in distribution.secrets(group).iter().enumerate() {
                let holder_number = match sharer.holders.recipient(group, position) {
                    Some(n) if self.controls(n) => n,
                    _ => continue,
                };
                let Some(holder) = self.state.relay(holder_number) else {
                    continue;
                };
                let Some(point) = sharer.public_key_set.key_sixteenth(position) else {
                    continue;
                };

                let secret = holder
                    .public_key_set
                    .decrypt(encrypted, point, &*self.keys)
                    .filter(|s| sharer.public_key_set.verify_row(position, s));
                match secret {
                    Some(secret) => self.store_row(&secret),
                    None => {
                        warn!(
                            relay = %sharer.number,
                            holder = %holder_number,
                            position,
                            "undecryptable key sixteenth"
                        );
                        unopened.push((group, position, holder_number));
                    }
                }
            }
        }

        if !self.config.send_key_distribution_complaints {
            return;
        }
        for (group, position, holder) in unopened {
            self.respond(hash, |node| {
                let complainer = node
                    .state
                    .relay(holder)
                    .ok_or(Error::MissingKeyMaterial(holder))?;
                let complaint = KeyDistributionComplaint::generate(
                    hash,
                    group,
                    position,
                    &sharer,
                    complainer,
                    &*node.keys,
                )?;
                node.publish_as(holder, complaint)?;
                Ok(())
            });
        }
    }

    pub(crate) fn on_key_distribution_complaint(
        &mut self,
        hash: MessageHash,
        complaint: Signed<KeyDistributionComplaint>,
    ) -> Result<(), Error> {
        let sharer = match self
            .messages
            .fetch::<KeyDistribution>(&complaint.content.key_distribution)
        {
            Some(d) => d.content.relay_number,
            None => return Ok(()),
        };
        warn!(relay = %sharer, hash = %hash, "key distribution complaint upheld");
        let obituary = self.state.process_key_distribution_complaint(
            hash,
            sharer,
            self.config.good_standing_age,
            &mut *self.messages,
        )?;
        if let Some(obituary) = obituary {
            self.on_relay_death(obituary);
        }
        Ok(())
    }
}
