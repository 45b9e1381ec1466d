//! Outbound notifications emitted by the A2DP profile.
//!
//! The state machine produces [`Broadcast`] values; a [`BroadcastSink`]
//! delivers them to whoever listens (the D-Bus service in the daemon, a
//! recorder in tests).

use std::future::Future;

use crate::{
   a2dp::{ConnectionState, PlayingState, codec::CodecStatus},
   bluetooth::address::Address,
   error::Result,
};

/// Notifications that can be emitted by the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
   ConnectionStateChanged {
      device: Address,
      previous: ConnectionState,
      state: ConnectionState,
   },
   PlayingStateChanged {
      device: Address,
      previous: PlayingState,
      state: PlayingState,
   },
   CodecConfigChanged {
      device: Address,
      status: CodecStatus,
   },
}

impl Broadcast {
   pub const fn device(&self) -> Address {
      match self {
         Self::ConnectionStateChanged { device, .. }
         | Self::PlayingStateChanged { device, .. }
         | Self::CodecConfigChanged { device, .. } => *device,
      }
   }

   /// Connection changes are the only broadcasts delivered under a wake lock.
   pub const fn needs_wake_lock(&self) -> bool {
      matches!(self, Self::ConnectionStateChanged { .. })
   }
}

/// Trait for implementing broadcast delivery.
pub trait BroadcastSink: Send + Sync + 'static {
   /// Delivers one broadcast. Called from a single task, in enqueue order.
   fn deliver(&self, broadcast: Broadcast) -> impl Future<Output = Result<()>> + Send;
}
