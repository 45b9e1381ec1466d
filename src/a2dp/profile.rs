//! The A2DP profile: a cloneable-by-reference handle in front of an actor
//! that owns the connection state machine.
//!
//! Requests and stack events share one inbox, so every slot mutation runs
//! one at a time in arrival order. The connect timeout comes back through a
//! separate loopback channel.

use std::{sync::Arc, time::Duration};

use log::{debug, info};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use super::{
   broadcaster::ConnectionStateBroadcaster,
   codec::CodecConfig,
   priority::CodecPriorityResolver,
   query::ConnectionQuery,
   state_machine::{Effect, Input, Request, StateMachine, TimerId},
};
use crate::{
   bluetooth::{
      address::Address,
      bridge::{NativeStackBridge, StackEvent},
      policy::ConnectPolicy,
   },
   config::Config,
   error::{A2dpError, Result},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

enum Command {
   Request(Request, oneshot::Sender<()>),
   Stack(StackEvent, oneshot::Sender<()>),
   ConnectTimeout(TimerId),
   Quit(oneshot::Sender<()>),
}

/// Handle to a running A2DP profile.
pub struct A2dpProfile {
   inbox: mpsc::Sender<Command>,
   query: ConnectionQuery,
   resolver: CodecPriorityResolver,
   bridge: Arc<dyn NativeStackBridge>,
}

impl A2dpProfile {
   /// Initializes the native stack with the resolved codec table and starts
   /// the actor.
   pub fn make(
      config: &Config,
      bridge: Arc<dyn NativeStackBridge>,
      policy: Arc<dyn ConnectPolicy>,
      broadcaster: ConnectionStateBroadcaster,
   ) -> Self {
      let resolver = CodecPriorityResolver::new(config.codec_priorities.clone());
      bridge.initialize(resolver.table());

      let machine = StateMachine::new(bridge.clone(), policy.clone());
      let query = ConnectionQuery::new(machine.state(), policy);
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         ProfileActor::new(machine, broadcaster, command_rx, config.connect_timeout()).run(),
      );

      Self {
         inbox: command_tx,
         query,
         resolver,
         bridge,
      }
   }

   pub async fn connect(&self, device: Address) -> Result<()> {
      self.request(Request::Connect(device)).await
   }

   pub async fn disconnect(&self, device: Address) -> Result<()> {
      self.request(Request::Disconnect(device)).await
   }

   async fn request(&self, req: Request) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Request(req, tx))
         .await
         .map_err(|_| A2dpError::ProfileShutdown)?;
      rx.await.map_err(|_| A2dpError::ProfileShutdown)
   }

   pub const fn query(&self) -> &ConnectionQuery {
      &self.query
   }

   /// Where the native stack delivers its events.
   pub fn stack_events(&self) -> StackEventSender {
      StackEventSender {
         inbox: self.inbox.clone(),
      }
   }

   pub fn set_codec_config_preference(&self, config: CodecConfig) -> Result<()> {
      self.push_preferences(&[config])
   }

   pub fn enable_optional_codecs(&self) -> Result<()> {
      self.push_preferences(&self.resolver.enable_optional_codecs())
   }

   pub fn disable_optional_codecs(&self) -> Result<()> {
      self.push_preferences(&self.resolver.disable_optional_codecs())
   }

   fn push_preferences(&self, configs: &[CodecConfig]) -> Result<()> {
      if self.bridge.set_codec_config_preference(configs) {
         Ok(())
      } else {
         Err(A2dpError::CodecPreferenceRejected)
      }
   }

   /// Resolves any outgoing connect and active stream, waits for their
   /// broadcasts to be delivered, then stops the actor.
   pub async fn quit(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Quit(tx))
         .await
         .map_err(|_| A2dpError::ProfileShutdown)?;
      rx.await.map_err(|_| A2dpError::ProfileShutdown)
   }

   /// Releases native resources. Call after [`Self::quit`].
   pub fn cleanup(&self) {
      self.bridge.cleanup();
   }
}

/// Feeds native stack events into the profile actor.
#[derive(Clone)]
pub struct StackEventSender {
   inbox: mpsc::Sender<Command>,
}

impl StackEventSender {
   /// Returns once the event has been processed.
   pub async fn send(&self, event: StackEvent) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Stack(event, tx))
         .await
         .map_err(|_| A2dpError::ProfileShutdown)?;
      rx.await.map_err(|_| A2dpError::ProfileShutdown)
   }
}

// === Profile Actor ===

struct ProfileActor {
   machine: StateMachine,
   broadcaster: ConnectionStateBroadcaster,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::Receiver<Command>,
   loopback_tx: mpsc::Sender<Command>,
   connect_timeout: Duration,
   timer: Option<JoinHandle<()>>,
}

impl ProfileActor {
   fn new(
      machine: StateMachine,
      broadcaster: ConnectionStateBroadcaster,
      command_rx: mpsc::Receiver<Command>,
      connect_timeout: Duration,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         machine,
         broadcaster,
         command_rx,
         loopback_rx,
         loopback_tx,
         connect_timeout,
         timer: None,
      }
   }

   async fn run(mut self) {
      info!("A2DP profile starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("A2DP profile shutting down");
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            Some(cmd) = self.loopback_rx.recv() => {
               if !self.handle_command(cmd).await {
                  break;
               }
            }
         }
      }

      self.cancel_timer();
   }

   async fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::Request(req, reply) => {
            let effects = self.machine.process(Input::Request(req));
            self.apply(effects);
            let _ = reply.send(());
         },
         Command::Stack(event, reply) => {
            let effects = self.machine.process(Input::Stack(event));
            self.apply(effects);
            let _ = reply.send(());
         },
         Command::ConnectTimeout(id) => {
            let effects = self.machine.process(Input::ConnectTimeout(id));
            self.apply(effects);
         },
         Command::Quit(reply) => {
            info!("A2DP profile quitting");
            let effects = self.machine.quit();
            self.apply(effects);
            self.broadcaster.flush().await;
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   fn apply(&mut self, effects: Vec<Effect>) {
      for effect in effects {
         match effect {
            Effect::Broadcast(broadcast) => self.broadcaster.send(broadcast),
            Effect::ArmConnectTimeout(id) => {
               self.cancel_timer();
               let loopback = self.loopback_tx.clone();
               let delay = self.connect_timeout;
               self.timer = Some(tokio::spawn(async move {
                  time::sleep(delay).await;
                  let _ = loopback.send(Command::ConnectTimeout(id)).await;
               }));
            },
            Effect::CancelConnectTimeout => self.cancel_timer(),
         }
      }
   }

   fn cancel_timer(&mut self) {
      if let Some(timer) = self.timer.take() {
         debug!("Connect timeout cancelled");
         timer.abort();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      a2dp::{
         ConnectionState, MachineState,
         codec::{CODEC_PRIORITY_DEFAULT, CODEC_PRIORITY_HIGHEST, CodecType},
      },
      bluetooth::{
         bridge::{
            RawConnectionState,
            fake::{FakeBridge, NativeCall},
         },
         policy::fake::StaticPolicy,
      },
      event::{Broadcast, fake::RecordingSink},
      power::fake::CountingWakeLock,
   };

   const A: Address = Address::new([0xA; 6]);
   const B: Address = Address::new([0xB; 6]);

   struct Setup {
      profile: A2dpProfile,
      bridge: Arc<FakeBridge>,
      sink: RecordingSink,
      broadcaster: ConnectionStateBroadcaster,
   }

   fn setup() -> Setup {
      let bridge = Arc::new(FakeBridge::new());
      let broadcaster = ConnectionStateBroadcaster::new(Arc::new(CountingWakeLock::default()));
      let sink = RecordingSink::default();
      broadcaster.spawn_dispatcher(sink.clone());
      let profile = A2dpProfile::make(
         &Config::default(),
         bridge.clone(),
         Arc::new(StaticPolicy::accepting()),
         broadcaster.clone(),
      );
      Setup {
         profile,
         bridge,
         sink,
         broadcaster,
      }
   }

   fn conn(device: Address, previous: ConnectionState, state: ConnectionState) -> Broadcast {
      Broadcast::ConnectionStateChanged { device, previous, state }
   }

   #[tokio::test]
   async fn test_make_initializes_codec_table() {
      let s = setup();
      let calls = s.bridge.calls();
      let NativeCall::Initialize(table) = &calls[0] else {
         panic!("expected initialize, got {calls:?}");
      };
      assert_eq!(table.len(), CodecType::ALL.len());
      assert!(table.iter().all(|c| c.priority == CODEC_PRIORITY_DEFAULT));
   }

   #[tokio::test]
   async fn test_connect_through_actor() {
      let s = setup();
      s.profile.connect(A).await.unwrap();
      assert_eq!(s.profile.query().connection_state(&A), ConnectionState::Connecting);

      s.profile
         .stack_events()
         .send(StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Connected,
            device: A,
         })
         .await
         .unwrap();
      assert_eq!(s.profile.query().connection_state(&A), ConnectionState::Connected);
      assert_eq!(s.profile.query().connected_devices(), vec![A]);

      s.broadcaster.flush().await;
      let seen = s.sink.seen();
      assert_eq!(seen[0], conn(A, ConnectionState::Disconnected, ConnectionState::Connecting));
      assert_eq!(seen[1], conn(A, ConnectionState::Connecting, ConnectionState::Connected));
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_timeout_through_actor() {
      let s = setup();
      s.profile.connect(A).await.unwrap();

      time::sleep(Duration::from_secs(31)).await;
      assert_eq!(s.profile.query().machine_state(), MachineState::Disconnected);
      assert_eq!(s.profile.query().connection_state(&A), ConnectionState::Disconnected);

      s.broadcaster.flush().await;
      let reverted = s
         .sink
         .seen()
         .into_iter()
         .filter(|b| *b == conn(A, ConnectionState::Connecting, ConnectionState::Disconnected))
         .count();
      assert_eq!(reverted, 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_stack_event_cancels_timeout() {
      let s = setup();
      s.profile.connect(A).await.unwrap();
      s.profile
         .stack_events()
         .send(StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Connected,
            device: A,
         })
         .await
         .unwrap();

      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(s.profile.query().connection_state(&A), ConnectionState::Connected);
   }

   #[tokio::test]
   async fn test_concurrent_connects_issue_one_native_call() {
      let s = setup();
      let (a, b) = tokio::join!(s.profile.connect(A), s.profile.connect(B));
      a.unwrap();
      b.unwrap();

      let connects = s
         .bridge
         .calls()
         .into_iter()
         .filter(|c| matches!(c, NativeCall::Connect(_)))
         .count();
      assert_eq!(connects, 1);
   }

   #[tokio::test]
   async fn test_quit_then_cleanup() {
      let s = setup();
      s.profile.connect(A).await.unwrap();
      s.profile.quit().await.unwrap();

      // quit waits for delivery
      assert_eq!(
         s.sink.seen().last(),
         Some(&conn(A, ConnectionState::Connecting, ConnectionState::Disconnected))
      );
      assert!(matches!(s.profile.connect(B).await, Err(A2dpError::ProfileShutdown)));

      s.profile.cleanup();
      assert_eq!(s.bridge.calls().last(), Some(&NativeCall::Cleanup));
   }

   #[tokio::test]
   async fn test_codec_preferences_go_to_native() {
      let s = setup();
      s.bridge.take_calls();

      let ldac = CodecConfig::new(CodecType::Ldac, 5000);
      s.profile.set_codec_config_preference(ldac).unwrap();
      s.profile.disable_optional_codecs().unwrap();
      s.profile.enable_optional_codecs().unwrap();

      assert_eq!(
         s.bridge.calls(),
         vec![
            NativeCall::SetCodecConfigPreference(vec![ldac]),
            NativeCall::SetCodecConfigPreference(vec![CodecConfig::new(
               CodecType::Sbc,
               CODEC_PRIORITY_HIGHEST
            )]),
            NativeCall::SetCodecConfigPreference(vec![CodecConfig::new(
               CodecType::Sbc,
               CODEC_PRIORITY_DEFAULT
            )]),
         ]
      );
   }

   #[tokio::test]
   async fn test_enable_optional_codecs_keeps_sbc_override() {
      let mut config = Config::default();
      config.codec_priorities.sbc = Some(700);
      let bridge = Arc::new(FakeBridge::new());
      let profile = A2dpProfile::make(
         &config,
         bridge.clone(),
         Arc::new(StaticPolicy::accepting()),
         ConnectionStateBroadcaster::new(Arc::new(CountingWakeLock::default())),
      );
      bridge.take_calls();

      profile.enable_optional_codecs().unwrap();
      assert_eq!(bridge.calls(), vec![NativeCall::SetCodecConfigPreference(vec![
         CodecConfig::new(CodecType::Sbc, 700)
      ])]);
   }
}
