//! Seam between the profile and the native Bluetooth stack.
//!
//! The stack exposes fire-and-forget commands through [`NativeStackBridge`]
//! and reports results later as [`StackEvent`]s.

use crate::{
   a2dp::{
      codec::{Capabilities, CodecConfig},
      priority::CodecPriorityTable,
   },
   bluetooth::address::Address,
};

/// Connection states as reported by the stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum RawConnectionState {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

/// Audio stream states as reported by the stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum RawAudioState {
   RemoteSuspend = 0,
   Stopped = 1,
   Started = 2,
}

/// Asynchronous notifications delivered by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
   ConnectionStateChanged {
      state: RawConnectionState,
      device: Address,
   },
   AudioStateChanged {
      state: RawAudioState,
      device: Address,
   },
   CodecConfigChanged {
      selected: CodecConfig,
      local_capabilities: Capabilities,
      selectable_capabilities: Capabilities,
   },
}

/// Commands accepted by the native stack.
///
/// Every call must return promptly; outcomes of `connect` and `disconnect`
/// arrive later as [`StackEvent::ConnectionStateChanged`]. A `false` return
/// means the command was rejected outright.
pub trait NativeStackBridge: Send + Sync {
   fn initialize(&self, priorities: &CodecPriorityTable);

   fn cleanup(&self);

   fn connect(&self, device: Address) -> bool;

   fn disconnect(&self, device: Address) -> bool;

   fn set_codec_config_preference(&self, configs: &[CodecConfig]) -> bool;
}
