//! Picozen: a lightweight pub/sub/query session engine for constrained
//! nodes.
//!
//! A [`Session`] owns a transport (unicast client↔router / peer↔peer, or
//! multicast peer-to-peer) and dispatches publications, queries, and
//! replies between the wire and locally declared entities. Link drivers
//! are injected through the [`picozen_core::link::LinkManager`] contract;
//! the in-process drivers in [`inproc`] connect co-located sessions.
//!
//! ```no_run
//! use std::sync::Arc;
//! use picozen::{Config, Session};
//! use picozen::handlers::fifo_channel;
//! use picozen::keyexpr::KeyExpr;
//!
//! # async fn run(links: Arc<dyn picozen::link::LinkManager>) -> picozen::ZResult<()> {
//! let mut config = Config::default();
//! config.insert("mode", "client")?;
//! config.insert("connect", "tcp/192.168.1.1:7447")?;
//!
//! let session = Session::open(config, links).await?;
//! let key = KeyExpr::new("demo/example/**")?;
//! let (callback, samples) = fifo_channel(16);
//! let _sub = session
//!     .declare_subscriber(&key, callback, Default::default())
//!     .await?;
//! while let Ok(sample) = samples.recv() {
//!     println!("{} = {:?}", sample.key_expr, sample.payload);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
mod admin;
pub mod advanced;
pub mod config;
pub mod connectivity;
pub mod inproc;
pub mod liveliness;
pub mod publisher;
pub mod query;
pub mod queryable;
pub mod sample;
mod scouting;
pub mod session;
pub mod subscriber;
mod transport;

pub use config::Config;
pub use session::Session;

pub use publisher::{Publisher, PublisherOptions};
pub use query::{CancellationToken, GetOptions};
pub use queryable::{Query, Queryable, QueryableOptions};
pub use sample::{Qos, Reply, Sample, SampleKind, SourceInfo};
pub use subscriber::{Subscriber, SubscriberOptions};

pub use advanced::{
    AdvancedPublisher, AdvancedPublisherOptions, AdvancedSubscriber,
    AdvancedSubscriberOptions, MissEvent,
};
pub use connectivity::{
    ConnectivityEventKind, LinkEvent, LinkInfo, ListenerHandle, TransportEvent,
    TransportVariant,
};
pub use liveliness::LivelinessToken;

// Re-export the kernel surface users interact with.
pub use picozen_core::error::{ResultCode, ZError, ZResult};
pub use picozen_core::handlers;
pub use picozen_core::id::{EntityGlobalId, WhatAmI, ZenohId};
pub use picozen_core::keyexpr;
pub use picozen_core::link;
pub use picozen_core::locator::Locator;
pub use picozen_proto::network::{
    ConsolidationMode, Encoding, QueryTarget, Reliability, Timestamp,
};
