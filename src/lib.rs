//! Key custody and succession for a permissioned network of relays.
//!
//! The relays jointly hold a large number of private keys, in such a way that
//! no relay ever holds a complete key by itself, and that the network keeps
//! every key through relays going offline, leaving, or misbehaving.
//!
//! # Warning
//!
//! This is experimental cryptographic software. It has not been audited,
//! and the protocol has no formal proof of security.
//!
//! # Design
//!
//! Each relay has sixteen secret *key sixteenths*, whose sum is its signing
//! key. Alongside each key sixteenth, a relay publishes three blinding points,
//! and these rows make up its public key set. From a public key set, anybody
//! can derive the *receiving key* for any point: a weighted sum of the
//! relay's key parts, with weights drawn from a hash of the point.
//! Encrypting a secret to a relay means masking it with the shared secret
//! `r(P) * P`, where `P` is the public point of the secret and `r(P)` is the
//! relay's private receiving key for it.
//!
//! The receiving key splits into four *quarters*, one for each four rows,
//! and these four quarters add up to the full key. That is what lets a
//! relay's secrets survive it:
//!
//! - Once enough relays have joined after it, a relay hands out its key
//!   sixteenths. Four *key quarter holders* get four sixteenths each, and two
//!   sets of sixteen *key sixteenth holders* get one each.
//! - When a relay dies, its key quarter holders each send the dead relay's
//!   *successor* their quarter of the shared secret for every key sixteenth
//!   the dead relay held. Adding the four quarters gives the successor the
//!   shared secret, and with it the key sixteenth.
//! - A relay leaving of its own accord just re-encrypts what it holds to its
//!   successor.
//!
//! Everything that can go wrong along the way is settled in public:
//! complaints reveal the private receiving key of the failing slot, so that
//! everyone can check them, and audits make the quarter holders show their
//! work. Relays that lie, or don't answer in time, die in turn.
//!
//! ## API Design
//!
//! A [RelayNode] speaks for the relays it controls, and keeps the state of
//! the whole network, which it rebuilds from the messages every relay
//! broadcasts. Driving a node comes down to two methods:
//! ```ignore
//! impl RelayNode {
//!     pub fn handle(&mut self, message: RelayMessage) -> Result<Disposition, Error>;
//!     pub fn poll(&mut self);
//! }
//! ```
//! Messages from the network go to `handle`, and `poll` runs the deadline
//! checks that have come due. Any messages the node has to send in response
//! go out through its [Broadcast] implementation. That includes timeouts: a
//! deadline never changes the state directly, it only makes the node say
//! that an answer is missing, and that message is applied like any other. The network has to deliver
//! every message to every node, the sender included, in the same order.
//!
//! A [Runtime] does both of these on an asynchronous message feed.
mod admission;
mod config;
mod constants;
mod crypto;
mod error;
mod keysplit;
mod keystore;
pub mod messages;
mod network;
mod node;
mod relay;
mod runtime;
mod scheduler;
mod serde;
mod state;
mod store;
mod succession;
mod timeout;

pub use config::{Mode, RelayConfig};
pub use crypto::MessageHash;
pub use error::{Error, RelayStateError, ValidationError};
pub use keysplit::{EncryptedPoint, EncryptedSecret, PublicKeySet};
pub use keystore::{KeyStore, MemoryKeyStore};
pub use messages::{MessageKind, RelayMessage, Signed};
pub use network::{
    AdmissionAnchors, Broadcast, Clock, ManualClock, MemoryAnchorChain, Outbox, SystemClock,
};
pub use node::{Disposition, RelayNode};
pub use relay::{HolderGroup, KeyPartHolders, Relay, RelayNumber};
pub use runtime::Runtime;
pub use scheduler::Task;
pub use state::{DeathReason, Obituary, RelayState};
pub use store::{MemoryMessageStore, MessageFlag, MessageStore, MessageStoreExt, Record, ResponseKind};
