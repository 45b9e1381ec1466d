//! Read-only view of the profile state.

use std::{fmt::Write, sync::Arc};

use parking_lot::RwLock;

use super::{ConnectionState, MachineState, ProfileState, codec::CodecStatus};
use crate::bluetooth::{address::Address, policy::ConnectPolicy};

/// Lock-sharing accessors, callable from any task while the actor runs.
#[derive(Clone)]
pub struct ConnectionQuery {
   state: Arc<RwLock<ProfileState>>,
   policy: Arc<dyn ConnectPolicy>,
}

impl ConnectionQuery {
   pub fn new(state: Arc<RwLock<ProfileState>>, policy: Arc<dyn ConnectPolicy>) -> Self {
      Self { state, policy }
   }

   pub fn connection_state(&self, device: &Address) -> ConnectionState {
      self.state.read().connection_state(device)
   }

   pub fn connected_devices(&self) -> Vec<Address> {
      self.state.read().connected_devices()
   }

   pub fn is_playing(&self, device: &Address) -> bool {
      self.state.read().is_playing(device)
   }

   /// A copy of the last reported codec status.
   pub fn codec_status(&self) -> Option<CodecStatus> {
      self.state.read().codec_status.clone()
   }

   pub fn machine_state(&self) -> MachineState {
      self.state.read().machine
   }

   /// Bonded sink devices whose connection state is one of `states`.
   pub fn devices_matching_states(&self, states: &[ConnectionState]) -> Vec<Address> {
      let sinks = self.policy.bonded_sinks();
      let state = self.state.read();
      sinks
         .into_iter()
         .filter(|device| states.contains(&state.connection_state(device)))
         .collect()
   }

   pub fn dump(&self) -> String {
      let state = self.state.read();
      let slot = |s: Option<Address>| s.map_or_else(|| "none".to_owned(), |a| a.to_string());

      let mut out = String::new();
      let _ = writeln!(out, "state: {}", state.machine);
      let _ = writeln!(out, "current: {}", slot(state.current));
      let _ = writeln!(out, "target: {}", slot(state.target));
      let _ = writeln!(out, "incoming: {}", slot(state.incoming));
      let _ = writeln!(out, "playing: {}", slot(state.playing));
      if let Some(codec) = &state.codec_status {
         let _ = writeln!(out, "codec: {}", codec.selected.to_json());
      }
      out
   }
}
