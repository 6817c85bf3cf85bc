//! TopicBus - in-process publish/subscribe broker
//!
//! A single broker task owns every subscription and retained message and is
//! driven through a request channel. Clients talk to it through a cloneable
//! [`BusClient`] and read deliveries from their own [`Inbox`].
//!
//! # Semantics
//!
//! - **Topics**: `/`-separated, non-empty levels, no wildcards
//! - **Filters**: `+` matches one level, `#` matches the remaining levels
//! - **Ordering**: deliveries to one client keep publish order
//! - **Retained**: the last retained value per topic is replayed on subscribe
//! - **Last will**: published on behalf of a client that drops ungracefully
//!
//! Coordination code should depend on the [`Transport`] trait rather than on
//! [`BusClient`] directly.

mod broker;
mod client;
mod config;
mod error;
mod filter;
mod message;

pub use broker::{Broker, BrokerHandle};
pub use client::{BusClient, Inbox, Transport};
pub use config::BrokerConfig;
pub use error::BusError;
pub use filter::{TopicFilter, validate_topic};
pub use message::{BrokerMetrics, BrokerRequest, LastWill, Message};
