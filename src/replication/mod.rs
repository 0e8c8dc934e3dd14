//! Replication subsystem: Publisher (C6) ships local mutations out as CBOR
//! events over a durable outbox; Applier (C7) takes inbound events and
//! reconciles them into the store without ever re-publishing.

pub mod applier;
pub mod publisher;

pub use applier::Applier;
pub use publisher::Publisher;
