//! A2DP sink profile core.
//!
//! This module owns the connection state machine, its shared slot state, the
//! codec priority table and the serialized broadcaster feeding listeners.

pub mod broadcaster;
pub mod codec;
pub mod priority;
pub mod profile;
pub mod query;
pub mod state_machine;

use serde::{Deserialize, Serialize};

use crate::bluetooth::address::Address;
use codec::CodecStatus;

/// Public per-device connection state of the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// Public per-device streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlayingState {
   Playing,
   NotPlaying,
}

/// Internal states of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum MachineState {
   #[default]
   Disconnected,
   Pending,
   Connected,
}

/// Everything the state machine mutates and the query surface reads.
///
/// Written only by the profile actor, under the write lock, for the
/// duration of one transition.
#[derive(Debug, Clone, Default)]
pub struct ProfileState {
   pub machine: MachineState,
   /// Device believed connected, or being torn down.
   pub current: Option<Address>,
   /// Device an outgoing connect was issued for.
   pub target: Option<Address>,
   /// Device that initiated a link toward us.
   pub incoming: Option<Address>,
   /// Device currently streaming audio.
   pub playing: Option<Address>,
   pub codec_status: Option<CodecStatus>,
}

impl ProfileState {
   pub fn connection_state(&self, device: &Address) -> ConnectionState {
      let is = |slot: Option<Address>| slot.as_ref() == Some(device);
      match self.machine {
         MachineState::Disconnected => ConnectionState::Disconnected,
         MachineState::Pending => {
            if is(self.target) {
               ConnectionState::Connecting
            } else if is(self.current) {
               ConnectionState::Disconnecting
            } else if is(self.incoming) {
               ConnectionState::Connecting
            } else {
               ConnectionState::Disconnected
            }
         },
         MachineState::Connected if is(self.current) => ConnectionState::Connected,
         MachineState::Connected => ConnectionState::Disconnected,
      }
   }

   pub fn connected_devices(&self) -> Vec<Address> {
      match (self.machine, self.current) {
         (MachineState::Connected, Some(current)) => vec![current],
         _ => Vec::new(),
      }
   }

   pub fn is_playing(&self, device: &Address) -> bool {
      self.playing.as_ref() == Some(device)
   }

   /// Whether the slot assignment is legal for the current machine state.
   pub fn slots_consistent(&self) -> bool {
      let playing_ok = self.playing.is_none() || self.playing == self.current;
      match self.machine {
         MachineState::Disconnected => {
            self.current.is_none()
               && self.target.is_none()
               && self.incoming.is_none()
               && self.playing.is_none()
         },
         MachineState::Pending => {
            let any = self.current.is_some() || self.target.is_some() || self.incoming.is_some();
            let both = self.target.is_some() && self.incoming.is_some();
            any && !both && playing_ok
         },
         MachineState::Connected => {
            self.current.is_some() && self.target.is_none() && self.incoming.is_none() && playing_ok
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const A: Address = Address::new([0xA; 6]);
   const B: Address = Address::new([0xB; 6]);
   const C: Address = Address::new([0xC; 6]);

   #[test]
   fn test_pending_projection() {
      let state = ProfileState {
         machine: MachineState::Pending,
         current: Some(A),
         target: Some(B),
         ..Default::default()
      };
      assert_eq!(state.connection_state(&A), ConnectionState::Disconnecting);
      assert_eq!(state.connection_state(&B), ConnectionState::Connecting);
      assert_eq!(state.connection_state(&C), ConnectionState::Disconnected);
      assert!(state.connected_devices().is_empty());
      assert!(state.slots_consistent());

      let incoming = ProfileState {
         machine: MachineState::Pending,
         incoming: Some(C),
         ..Default::default()
      };
      assert_eq!(incoming.connection_state(&C), ConnectionState::Connecting);
   }

   #[test]
   fn test_disconnected_ignores_slots() {
      let state = ProfileState {
         current: Some(A),
         ..Default::default()
      };
      assert_eq!(state.connection_state(&A), ConnectionState::Disconnected);
      assert!(!state.slots_consistent());
   }

   #[test]
   fn test_connected_projection() {
      let state = ProfileState {
         machine: MachineState::Connected,
         current: Some(A),
         playing: Some(A),
         ..Default::default()
      };
      assert_eq!(state.connection_state(&A), ConnectionState::Connected);
      assert_eq!(state.connection_state(&B), ConnectionState::Disconnected);
      assert_eq!(state.connected_devices(), vec![A]);
      assert!(state.is_playing(&A));
      assert!(!state.is_playing(&B));
      assert!(state.slots_consistent());

      let stray = ProfileState {
         target: Some(B),
         ..state
      };
      assert!(!stray.slots_consistent());
   }
}
