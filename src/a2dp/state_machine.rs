//! Connection state machine of the A2DP sink profile.
//!
//! [`StateMachine::process`] runs one [`Input`] to completion under the
//! write lock of the shared [`ProfileState`]. Native connect and disconnect
//! commands are issued directly through the bridge (they only enqueue work in
//! the stack); broadcasts and timer changes come back as [`Effect`]s for the
//! caller to apply in order.

use std::{collections::VecDeque, sync::Arc};

use log::{debug, error, info, warn};
use parking_lot::RwLock;

use super::{ConnectionState as Conn, MachineState, PlayingState, ProfileState, codec::CodecStatus};
use crate::{
   bluetooth::{
      address::Address,
      bridge::{NativeStackBridge, RawAudioState, RawConnectionState, StackEvent},
      policy::{ConnectPolicy, ConnectionPriority},
   },
   event::Broadcast,
};

/// Requests coming from profile users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
   Connect(Address),
   Disconnect(Address),
}

/// Identifies one arming of the connect timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
   Request(Request),
   Stack(StackEvent),
   ConnectTimeout(TimerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
   Broadcast(Broadcast),
   /// Replace any running connect timeout with a fresh one.
   ArmConnectTimeout(TimerId),
   CancelConnectTimeout,
}

/// Role a device plays in the current slot assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
   Current,
   Target,
   Incoming,
   Unknown,
}

struct Context {
   bridge: Arc<dyn NativeStackBridge>,
   policy: Arc<dyn ConnectPolicy>,
   deferred: VecDeque<Request>,
   armed: Option<TimerId>,
   next_timer: u64,
}

pub struct StateMachine {
   state: Arc<RwLock<ProfileState>>,
   ctx: Context,
}

impl StateMachine {
   pub fn new(bridge: Arc<dyn NativeStackBridge>, policy: Arc<dyn ConnectPolicy>) -> Self {
      Self {
         state: Arc::new(RwLock::new(ProfileState::default())),
         ctx: Context {
            bridge,
            policy,
            deferred: VecDeque::new(),
            armed: None,
            next_timer: 0,
         },
      }
   }

   /// Shared state for concurrent readers.
   pub fn state(&self) -> Arc<RwLock<ProfileState>> {
      self.state.clone()
   }

   #[cfg(test)]
   pub fn deferred_len(&self) -> usize {
      self.ctx.deferred.len()
   }

   pub fn process(&mut self, input: Input) -> Vec<Effect> {
      let mut guard = self.state.write();
      let mut step = Step {
         st: &mut *guard,
         ctx: &mut self.ctx,
         effects: Vec::new(),
      };
      step.handle(input);
      step.replay_deferred();
      step.effects
   }

   /// Resolves an in-flight outgoing connect and any active stream before
   /// teardown.
   pub fn quit(&mut self) -> Vec<Effect> {
      let mut guard = self.state.write();
      let mut step = Step {
         st: &mut *guard,
         ctx: &mut self.ctx,
         effects: Vec::new(),
      };
      if let Some(target) = step.st.target.take() {
         step.connection(target, Conn::Connecting, Conn::Disconnected);
      }
      if let Some(playing) = step.st.playing {
         step.clear_playing(playing);
      }
      step.cancel_timer();
      step.ctx.deferred.clear();
      step.effects
   }
}

/// One input being processed, with the write lock held.
struct Step<'a> {
   st: &'a mut ProfileState,
   ctx: &'a mut Context,
   effects: Vec<Effect>,
}

impl Step<'_> {
   fn handle(&mut self, input: Input) {
      match input {
         Input::Request(req) => self.request(req),
         Input::Stack(event) => self.stack_event(event),
         Input::ConnectTimeout(id) => self.connect_timeout(id),
      }
   }

   fn request(&mut self, req: Request) {
      match self.st.machine {
         MachineState::Disconnected => self.disconnected_request(req),
         MachineState::Pending => self.pending_request(req),
         MachineState::Connected => self.connected_request(req),
      }
   }

   fn stack_event(&mut self, event: StackEvent) {
      match event {
         StackEvent::ConnectionStateChanged { state, device } => match self.st.machine {
            MachineState::Disconnected => self.disconnected_link(state, device),
            MachineState::Pending => {
               self.cancel_timer();
               self.pending_link(state, device);
            },
            MachineState::Connected => self.connected_link(state, device),
         },
         StackEvent::AudioStateChanged { state, device } => self.audio(state, device),
         StackEvent::CodecConfigChanged {
            selected,
            local_capabilities,
            selectable_capabilities,
         } => self.codec_changed(CodecStatus {
            selected,
            local_capabilities,
            selectable_capabilities,
         }),
      }
   }

   fn connect_timeout(&mut self, id: TimerId) {
      if self.ctx.armed != Some(id) {
         debug!("Ignoring stale connect timeout {id:?}");
         return;
      }
      self.ctx.armed = None;

      match (self.st.machine, self.st.target) {
         (MachineState::Pending, Some(target)) => {
            warn!("Connect to {target} timed out");
            self.pending_link(RawConnectionState::Disconnected, target);
         },
         (machine, _) => debug!("Connect timeout with no outgoing connect in {machine}"),
      }
   }

   // === Disconnected ===

   fn disconnected_request(&mut self, req: Request) {
      self.repair_disconnected();
      match req {
         Request::Connect(device) => {
            self.connection(device, Conn::Disconnected, Conn::Connecting);
            if !self.ctx.bridge.connect(device) {
               warn!("Native connect to {device} rejected");
               self.connection(device, Conn::Connecting, Conn::Disconnected);
               return;
            }
            self.st.target = Some(device);
            self.transition(MachineState::Pending);
            self.arm_timer();
         },
         Request::Disconnect(device) => {
            debug!("Ignoring disconnect of {device}, nothing connected");
         },
      }
   }

   fn disconnected_link(&mut self, state: RawConnectionState, device: Address) {
      self.repair_disconnected();
      match state {
         RawConnectionState::Connecting | RawConnectionState::Connected
            if !self.ok_to_connect(device) =>
         {
            info!("Incoming A2DP from {device} rejected");
            self.native_disconnect(device);
         },
         RawConnectionState::Connecting => {
            info!("Incoming A2DP from {device} accepted");
            self.connection(device, Conn::Disconnected, Conn::Connecting);
            self.st.incoming = Some(device);
            self.transition(MachineState::Pending);
         },
         RawConnectionState::Connected => {
            info!("Incoming A2DP from {device} accepted, already connected");
            self.connection(device, Conn::Disconnected, Conn::Connected);
            self.st.current = Some(device);
            self.transition(MachineState::Connected);
         },
         RawConnectionState::Disconnected | RawConnectionState::Disconnecting => {
            debug!("Ignoring {state} from {device} while disconnected");
         },
      }
   }

   // === Pending ===

   fn pending_request(&mut self, req: Request) {
      match req {
         Request::Disconnect(device) if self.st.target == Some(device) => {
            info!("Cancelling outgoing connect to {device}");
            self.connection(device, Conn::Connecting, Conn::Disconnected);
            self.st.target = None;
            self.cancel_timer();
            if self.st.current.is_none() {
               self.native_disconnect(device);
               self.leave_pending_if_idle();
            }
         },
         req => {
            debug!("Deferring {req:?} while pending");
            self.ctx.deferred.push_back(req);
         },
      }
   }

   fn pending_link(&mut self, state: RawConnectionState, device: Address) {
      match (state, self.slot_of(device)) {
         (RawConnectionState::Disconnected, Slot::Current) => self.pending_current_gone(device),
         (RawConnectionState::Disconnected, Slot::Target) => {
            info!("Outgoing connect to {device} failed");
            self.connection(device, Conn::Connecting, Conn::Disconnected);
            self.st.target = None;
            self.leave_pending_if_idle();
         },
         (RawConnectionState::Disconnected, Slot::Incoming) => {
            self.connection(device, Conn::Connecting, Conn::Disconnected);
            self.st.incoming = None;
            self.leave_pending_if_idle();
         },
         (RawConnectionState::Disconnected, Slot::Unknown) => {
            warn!("Unknown device {device} disconnected while pending");
         },

         (RawConnectionState::Connected, Slot::Current) => {
            info!("Disconnect of {device} failed, still connected");
            self.connection(device, Conn::Disconnecting, Conn::Connected);
            if let Some(target) = self.st.target.take() {
               self.connection(target, Conn::Connecting, Conn::Disconnected);
            }
            self.drop_stray_incoming();
            self.transition(MachineState::Connected);
         },
         (RawConnectionState::Connected, Slot::Target) => {
            self.connection(device, Conn::Connecting, Conn::Connected);
            self.st.target = None;
            self.promote(device);
         },
         (RawConnectionState::Connected, Slot::Incoming) if self.ok_to_connect(device) => {
            info!("Incoming A2DP from {device} connected");
            self.connection(device, Conn::Connecting, Conn::Connected);
            self.st.incoming = None;
            self.promote(device);
         },
         (RawConnectionState::Connected, Slot::Incoming) => {
            warn!("Incoming A2DP from {device} rejected while pending");
            self.native_disconnect(device);
         },
         (RawConnectionState::Connected, Slot::Unknown) => self.resync_unknown(device),

         (RawConnectionState::Connecting, Slot::Unknown) => {
            if self.st.target.is_none() && self.st.incoming.is_none() && self.ok_to_connect(device)
            {
               info!("Incoming A2DP from {device} accepted while pending");
               self.connection(device, Conn::Disconnected, Conn::Connecting);
               self.st.incoming = Some(device);
            } else {
               info!("Incoming A2DP from {device} rejected while pending");
               self.native_disconnect(device);
            }
         },
         (RawConnectionState::Connecting | RawConnectionState::Disconnecting, slot) => {
            debug!("{device} ({slot:?}) reports {state} while pending");
         },
      }
   }

   /// The device being torn down finished disconnecting.
   fn pending_current_gone(&mut self, device: Address) {
      self.connection(device, Conn::Disconnecting, Conn::Disconnected);
      self.clear_playing(device);
      self.st.current = None;

      if let Some(target) = self.st.target {
         if self.ctx.bridge.connect(target) {
            self.arm_timer();
         } else {
            warn!("Native connect to {target} rejected");
            self.connection(target, Conn::Connecting, Conn::Disconnected);
            self.st.target = None;
            self.leave_pending_if_idle();
         }
         return;
      }

      if let Some(incoming) = self.st.incoming.take() {
         info!("Dropping incoming {incoming} together with {device}");
         self.connection(incoming, Conn::Connecting, Conn::Disconnected);
      }
      self.transition(MachineState::Disconnected);
   }

   /// Adopts a device the stack reports connected although no slot tracks it.
   fn resync_unknown(&mut self, device: Address) {
      error!("Unknown device {device} connected while pending, syncing with stack");
      if let Some(target) = self.st.target.take() {
         self.connection(target, Conn::Connecting, Conn::Disconnected);
      }
      if let Some(incoming) = self.st.incoming.take() {
         self.connection(incoming, Conn::Connecting, Conn::Disconnected);
      }
      if let Some(current) = self.st.current.take() {
         self.clear_playing(current);
         self.connection(current, Conn::Disconnecting, Conn::Disconnected);
      }
      self.connection(device, Conn::Disconnected, Conn::Connected);
      self.st.current = Some(device);
      self.transition(MachineState::Connected);
   }

   fn promote(&mut self, device: Address) {
      if let Some(old) = self.st.current.replace(device)
         && old != device
      {
         info!("{device} replaced {old} before it reported disconnect");
         self.clear_playing(old);
      }
      self.drop_stray_incoming();
      self.transition(MachineState::Connected);
   }

   fn drop_stray_incoming(&mut self) {
      if let Some(incoming) = self.st.incoming.take() {
         warn!("Dropping incoming {incoming}, another device connected");
         self.connection(incoming, Conn::Connecting, Conn::Disconnected);
         self.native_disconnect(incoming);
      }
   }

   fn leave_pending_if_idle(&mut self) {
      if self.st.current.is_none() && self.st.target.is_none() && self.st.incoming.is_none() {
         self.transition(MachineState::Disconnected);
      }
   }

   // === Connected ===

   fn connected_request(&mut self, req: Request) {
      let Some(current) = self.st.current else {
         error!("No current device while connected, dropping {req:?}");
         return;
      };

      match req {
         Request::Connect(device) if device == current => {
            debug!("Already connected to {device}");
         },
         Request::Connect(device) => {
            self.connection(device, Conn::Disconnected, Conn::Connecting);
            if !self.ctx.bridge.disconnect(current) {
               warn!("Native disconnect of {current} rejected, not switching to {device}");
               self.connection(device, Conn::Connecting, Conn::Disconnected);
               return;
            }
            self.connection(current, Conn::Connected, Conn::Disconnecting);
            self.st.target = Some(device);
            self.transition(MachineState::Pending);
            self.arm_timer();
         },
         Request::Disconnect(device) if device != current => {
            debug!("Ignoring disconnect of {device}, connected to {current}");
         },
         Request::Disconnect(device) => {
            self.connection(device, Conn::Connected, Conn::Disconnecting);
            if !self.ctx.bridge.disconnect(device) {
               warn!("Native disconnect of {device} rejected");
               self.connection(device, Conn::Disconnecting, Conn::Connected);
               return;
            }
            self.transition(MachineState::Pending);
         },
      }
   }

   fn connected_link(&mut self, state: RawConnectionState, device: Address) {
      match (state, self.slot_of(device)) {
         (RawConnectionState::Disconnected, Slot::Current) => {
            self.connection(device, Conn::Connected, Conn::Disconnected);
            self.clear_playing(device);
            self.st.current = None;
            self.transition(MachineState::Disconnected);
         },
         (RawConnectionState::Disconnected, Slot::Target) => {
            info!("Outgoing connect to {device} dropped while connected");
            self.connection(device, Conn::Connecting, Conn::Disconnected);
            self.st.target = None;
         },
         (RawConnectionState::Disconnected, _) => {
            warn!("Unknown device {device} disconnected while connected");
         },
         (state, Slot::Current) => debug!("Ignoring {state} for connected {device}"),
         (state, _) => warn!("Ignoring {state} from {device} while connected to another device"),
      }
   }

   // === Audio and codec ===

   fn audio(&mut self, state: RawAudioState, device: Address) {
      if self.st.machine != MachineState::Connected {
         debug!("Ignoring audio {state} from {device} while {}", self.st.machine);
         return;
      }
      if self.st.current != Some(device) {
         warn!("Audio {state} from {device}, which is not the connected device");
         return;
      }

      match state {
         RawAudioState::Started if self.st.playing.is_none() => {
            self.st.playing = Some(device);
            self.playing(device, PlayingState::NotPlaying, PlayingState::Playing);
         },
         RawAudioState::Started => {},
         RawAudioState::Stopped | RawAudioState::RemoteSuspend => self.clear_playing(device),
      }
   }

   fn codec_changed(&mut self, status: CodecStatus) {
      let previous = self.st.codec_status.replace(status.clone());
      let previous = previous.as_ref().map(|p| &p.selected);
      debug!(
         "Codec config {:?} -> {}",
         previous.map(|p| p.codec_type),
         status.selected.codec_type
      );
      for cap in &status.local_capabilities {
         debug!("Local capability: {}", cap.to_json());
      }
      for cap in &status.selectable_capabilities {
         debug!("Selectable capability: {}", cap.to_json());
      }

      if status.selected.same_audio_feeding_parameters(previous) {
         return;
      }
      if self.st.machine == MachineState::Connected
         && let Some(device) = self.st.current
      {
         self.effects
            .push(Effect::Broadcast(Broadcast::CodecConfigChanged { device, status }));
      }
   }

   // === Helpers ===

   fn transition(&mut self, to: MachineState) {
      debug!("{} -> {to}", self.st.machine);
      self.st.machine = to;

      match to {
         MachineState::Disconnected => {
            self.cancel_timer();
            self.repair_disconnected();
         },
         MachineState::Pending => {
            if self.st.target.is_some() && self.st.incoming.is_some() {
               error!(
                  "Inconsistent slots entering Pending: current = {:?} target = {:?} incoming = {:?}",
                  self.st.current, self.st.target, self.st.incoming
               );
            }
         },
         MachineState::Connected => {
            let deferred = self.ctx.deferred.len();
            self.ctx.deferred.retain(|req| !matches!(req, Request::Connect(_)));
            if deferred != self.ctx.deferred.len() {
               debug!("Discarded {} deferred connects", deferred - self.ctx.deferred.len());
            }
            if self.st.target.is_some() || self.st.incoming.is_some() {
               error!(
                  "Inconsistent slots entering Connected: current = {:?} target = {:?} incoming = {:?}",
                  self.st.current, self.st.target, self.st.incoming
               );
            }
            if let Some(current) = self.st.current {
               if let Some(playing) = self.st.playing
                  && playing != current
               {
                  self.clear_playing(playing);
               }
               // the stream always starts out stopped
               self.playing(current, PlayingState::Playing, PlayingState::NotPlaying);
            }
         },
      }
   }

   fn repair_disconnected(&mut self) {
      let st = &mut *self.st;
      if st.current.is_some() || st.target.is_some() || st.incoming.is_some() || st.playing.is_some()
      {
         error!(
            "Slots not empty while disconnected: current = {:?} target = {:?} incoming = {:?} playing = {:?}",
            st.current, st.target, st.incoming, st.playing
         );
         st.current = None;
         st.target = None;
         st.incoming = None;
         st.playing = None;
      }
   }

   fn replay_deferred(&mut self) {
      while self.st.machine != MachineState::Pending {
         let Some(req) = self.ctx.deferred.pop_front() else {
            break;
         };
         debug!("Replaying deferred {req:?}");
         self.request(req);
      }
   }

   fn slot_of(&self, device: Address) -> Slot {
      if self.st.current == Some(device) {
         Slot::Current
      } else if self.st.target == Some(device) {
         Slot::Target
      } else if self.st.incoming == Some(device) {
         Slot::Incoming
      } else {
         Slot::Unknown
      }
   }

   fn ok_to_connect(&self, device: Address) -> bool {
      let policy = &self.ctx.policy;
      if !policy.has_adapter_service() {
         return false;
      }
      if policy.is_quiet_mode() && self.st.target != Some(device) {
         return false;
      }
      match policy.priority(&device) {
         priority if priority.is_above_off() => true,
         ConnectionPriority::Undefined => policy.is_bonded(&device),
         _ => false,
      }
   }

   fn native_disconnect(&self, device: Address) {
      if !self.ctx.bridge.disconnect(device) {
         warn!("Native disconnect of {device} rejected");
      }
   }

   fn clear_playing(&mut self, device: Address) {
      if self.st.playing == Some(device) {
         self.st.playing = None;
         self.playing(device, PlayingState::Playing, PlayingState::NotPlaying);
      }
   }

   fn arm_timer(&mut self) {
      self.ctx.next_timer += 1;
      let id = TimerId(self.ctx.next_timer);
      self.ctx.armed = Some(id);
      self.effects.push(Effect::ArmConnectTimeout(id));
   }

   fn cancel_timer(&mut self) {
      if self.ctx.armed.take().is_some() {
         self.effects.push(Effect::CancelConnectTimeout);
      }
   }

   fn connection(&mut self, device: Address, previous: Conn, state: Conn) {
      self
         .effects
         .push(Effect::Broadcast(Broadcast::ConnectionStateChanged { device, previous, state }));
   }

   fn playing(&mut self, device: Address, previous: PlayingState, state: PlayingState) {
      self
         .effects
         .push(Effect::Broadcast(Broadcast::PlayingStateChanged { device, previous, state }));
   }
}
