//! [`NativeStackBridge`] on top of BlueZ over the system bus.
//!
//! Commands are `org.bluez.Device1` profile calls issued in the background.
//! Results come back through the signal monitor: a media transport showing
//! up means the A2DP link is connected, its removal (or a sink dropping its
//! ACL link) means disconnected, the transport `State` property drives the
//! audio state and its `Codec`/`Configuration` pair the codec status.

use std::{
   collections::HashMap,
   sync::{Arc, OnceLock},
};

use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::smallvec;
use smol_str::SmolStr;
use tokio::{runtime::Handle, task::JoinHandle};
use uuid::Uuid;
use zbus::{
   Connection, MatchRule, MessageStream,
   message::{Message, Type},
   zvariant::{OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   a2dp::{
      ConnectionState,
      codec::CodecConfig,
      priority::CodecPriorityTable,
      profile::StackEventSender,
      query::ConnectionQuery,
   },
   bluetooth::{
      address::Address,
      bridge::{NativeStackBridge, RawAudioState, RawConnectionState, StackEvent},
      media,
      policy::ConfigPolicy,
   },
   error::Result,
};

/// Audio Sink service class, the role of the remote device.
pub const A2DP_SINK_UUID: Uuid = uuid::uuid!("0000110b-0000-1000-8000-00805f9b34fb");

const BLUEZ: &str = "org.bluez";
const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const TRANSPORT_IFACE: &str = "org.bluez.MediaTransport1";

type Properties = HashMap<String, OwnedValue>;
type Interfaces = HashMap<String, Properties>;

/// Profile handles the bridge reports back to.
#[derive(Clone)]
struct Attached {
   events: StackEventSender,
   query: ConnectionQuery,
}

pub struct BluezBridge {
   connection: Connection,
   adapter: SmolStr,
   runtime: Handle,
   attached: OnceLock<Attached>,
   monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BluezBridge {
   pub fn new(connection: Connection, adapter: SmolStr, runtime: Handle) -> Self {
      Self {
         connection,
         adapter,
         runtime,
         attached: OnceLock::new(),
         monitor: Mutex::new(None),
      }
   }

   fn adapter_path(&self) -> String {
      format!("/org/bluez/{}", self.adapter)
   }

   /// Attaches the profile, reports the objects BlueZ already has, then
   /// follows its signals until [`NativeStackBridge::cleanup`].
   pub async fn spawn_monitor(
      &self,
      events: StackEventSender,
      query: ConnectionQuery,
      policy: Arc<ConfigPolicy>,
   ) -> Result<()> {
      let attached = Attached {
         events: events.clone(),
         query,
      };
      if self.attached.set(attached).is_err() {
         warn!("BlueZ monitor already running");
         return Ok(());
      }

      let rule = MatchRule::builder()
         .msg_type(Type::Signal)
         .sender(BLUEZ)?
         .build();
      let mut stream = MessageStream::for_match_rule(rule, &self.connection, Some(256)).await?;

      let mut monitor = Monitor::new(self.adapter_path(), policy);
      self.sync_objects(&mut monitor, &events).await?;

      let handle = tokio::spawn(async move {
         while let Some(msg) = stream.next().await {
            let msg = match msg {
               Ok(msg) => msg,
               Err(e) => {
                  warn!("Error receiving BlueZ signal: {e}");
                  continue;
               },
            };
            match monitor.translate(&msg) {
               Ok(translated) => {
                  for event in translated {
                     debug!("BlueZ: {event:?}");
                     if events.send(event).await.is_err() {
                        info!("Profile gone, stopping BlueZ monitor");
                        return;
                     }
                  }
               },
               Err(e) => warn!("Malformed BlueZ signal: {e}"),
            }
         }
         warn!("BlueZ signal stream ended");
      });
      *self.monitor.lock() = Some(handle);
      Ok(())
   }

   async fn sync_objects(&self, monitor: &mut Monitor, events: &StackEventSender) -> Result<()> {
      let reply = self
         .connection
         .call_method(
            Some(BLUEZ),
            "/",
            Some("org.freedesktop.DBus.ObjectManager"),
            "GetManagedObjects",
            &(),
         )
         .await?;
      let objects: HashMap<OwnedObjectPath, Interfaces> = reply.body().deserialize()?;

      let adapter_path = monitor.adapter_path.as_str();
      let adapter_found = objects
         .iter()
         .any(|(path, ifaces)| path.as_str() == adapter_path && ifaces.contains_key(ADAPTER_IFACE));
      if !adapter_found {
         warn!("Adapter {adapter_path} not found, links will be refused until it appears");
      }

      // Devices before their transports, so sinks are known when links come up.
      let mut objects: Vec<_> = objects.into_iter().collect();
      objects.sort_unstable_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
      for (path, interfaces) in &objects {
         for event in monitor.interfaces_added(path.as_str(), interfaces) {
            events.send(event).await?;
         }
      }
      Ok(())
   }

   fn spawn_call(
      &self,
      device: Address,
      method: &'static str,
      on_error: fn(&ConnectionQuery, Address) -> Option<StackEvent>,
   ) -> bool {
      let Some(Attached { events, query }) = self.attached.get().cloned() else {
         warn!("{method} to {device} before the BlueZ monitor started");
         return false;
      };
      let connection = self.connection.clone();
      let path = device.object_path(&self.adapter);

      self.runtime.spawn(async move {
         let result = connection
            .call_method(
               Some(BLUEZ),
               path.as_str(),
               Some(DEVICE_IFACE),
               method,
               &(A2DP_SINK_UUID.to_string(),),
            )
            .await;
         match result {
            Ok(_) => debug!("{method} to {device} accepted"),
            Err(e) => {
               warn!("{method} to {device} failed: {e}");
               if let Some(event) = on_error(&query, device) {
                  let _ = events.send(event).await;
               }
            },
         }
      });
      true
   }
}

fn connect_failed(_query: &ConnectionQuery, device: Address) -> Option<StackEvent> {
   Some(StackEvent::ConnectionStateChanged {
      state: RawConnectionState::Disconnected,
      device,
   })
}

/// Only a device still being torn down is reported back as connected.
fn disconnect_failed(query: &ConnectionQuery, device: Address) -> Option<StackEvent> {
   if query.connection_state(&device) != ConnectionState::Disconnecting {
      debug!("{device} no longer tracked, dropping failed disconnect");
      return None;
   }
   Some(StackEvent::ConnectionStateChanged {
      state: RawConnectionState::Connected,
      device,
   })
}

impl NativeStackBridge for BluezBridge {
   fn initialize(&self, priorities: &CodecPriorityTable) {
      info!("BlueZ bridge on {}", self.adapter);
      for config in priorities.as_slice() {
         debug!("Codec {} priority {}", config.codec_type, config.priority);
      }
   }

   fn cleanup(&self) {
      if let Some(handle) = self.monitor.lock().take() {
         handle.abort();
      }
      info!("BlueZ bridge cleaned up");
   }

   fn connect(&self, device: Address) -> bool {
      self.spawn_call(device, "ConnectProfile", connect_failed)
   }

   fn disconnect(&self, device: Address) -> bool {
      self.spawn_call(device, "DisconnectProfile", disconnect_failed)
   }

   // BlueZ picks the codec during endpoint negotiation; there is nothing to
   // push at runtime.
   fn set_codec_config_preference(&self, configs: &[CodecConfig]) -> bool {
      for config in configs {
         debug!(
            "Codec preference {} priority {}",
            config.codec_type, config.priority
         );
      }
      true
   }
}

fn on_adapter(path: &str, adapter_path: &str) -> bool {
   path
      .strip_prefix(adapter_path)
      .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn prop_bool(props: &Properties, name: &str) -> Option<bool> {
   match props.get(name).map(|v| &**v) {
      Some(Value::Bool(b)) => Some(*b),
      _ => None,
   }
}

fn prop_u8(props: &Properties, name: &str) -> Option<u8> {
   match props.get(name).map(|v| &**v) {
      Some(Value::U8(b)) => Some(*b),
      _ => None,
   }
}

fn prop_str<'a>(props: &'a Properties, name: &str) -> Option<&'a str> {
   match props.get(name).map(|v| &**v) {
      Some(Value::Str(s)) => Some(s.as_str()),
      _ => None,
   }
}

fn prop_bytes(props: &Properties, name: &str) -> Option<Vec<u8>> {
   let Some(Value::Array(bytes)) = props.get(name).map(|v| &**v) else {
      return None;
   };
   bytes
      .iter()
      .map(|b| match b {
         Value::U8(b) => Some(*b),
         _ => None,
      })
      .collect()
}

/// `Some(true)` if `UUIDs` is present and lists the A2DP sink service.
fn advertises_sink(props: &Properties) -> Option<bool> {
   let Some(Value::Array(uuids)) = props.get("UUIDs").map(|v| &**v) else {
      return None;
   };
   Some(uuids.iter().any(|uuid| match uuid {
      Value::Str(s) => Uuid::parse_str(s.as_str()).is_ok_and(|u| u == A2DP_SINK_UUID),
      _ => false,
   }))
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceInfo {
   sink: bool,
   paired: bool,
}

/// What the monitor has learned about the objects below one adapter.
struct Monitor {
   adapter_path: String,
   policy: Arc<ConfigPolicy>,
   devices: HashMap<Address, DeviceInfo>,
   /// Codec id of every open transport, by object path.
   transports: HashMap<String, Option<u8>>,
}

impl Monitor {
   fn new(adapter_path: String, policy: Arc<ConfigPolicy>) -> Self {
      Self {
         adapter_path,
         policy,
         devices: HashMap::new(),
         transports: HashMap::new(),
      }
   }

   /// Turns one BlueZ signal into stack events, updating the policy on the way.
   fn translate(&mut self, msg: &Message) -> zbus::Result<Vec<StackEvent>> {
      let header = msg.header();
      let (Some(member), Some(path)) = (header.member(), header.path()) else {
         return Ok(vec![]);
      };

      match member.as_str() {
         "PropertiesChanged" => {
            let (iface, changed, _invalidated): (String, Properties, Vec<String>) =
               msg.body().deserialize()?;
            Ok(self.properties_changed(path.as_str(), &iface, &changed))
         },
         "InterfacesAdded" => {
            let (object, interfaces): (OwnedObjectPath, Interfaces) = msg.body().deserialize()?;
            Ok(self.interfaces_added(object.as_str(), &interfaces))
         },
         "InterfacesRemoved" => {
            let (object, interfaces): (OwnedObjectPath, Vec<String>) = msg.body().deserialize()?;
            Ok(self.interfaces_removed(object.as_str(), &interfaces))
         },
         _ => Ok(vec![]),
      }
   }

   fn has_transport(&self, device: Address) -> bool {
      self
         .transports
         .keys()
         .any(|path| Address::from_object_path(path) == Some(device))
   }

   fn update_device(&mut self, device: Address, props: &Properties) {
      let info = self.devices.entry(device).or_default();
      if let Some(sink) = advertises_sink(props) {
         info.sink = sink;
      }
      if let Some(paired) = prop_bool(props, "Paired") {
         info.paired = paired;
      }
      if info.sink {
         self.policy.set_bonded(device, info.paired);
      }
   }

   fn codec_event(codec: Option<u8>, props: &Properties) -> Option<StackEvent> {
      let configuration = prop_bytes(props, "Configuration")?;
      let selected = codec.and_then(|c| media::parse_configuration(c, &configuration));
      let Some(selected) = selected else {
         debug!("Unsupported transport codec {codec:?}");
         return None;
      };
      Some(StackEvent::CodecConfigChanged {
         selected,
         local_capabilities: smallvec![selected],
         selectable_capabilities: smallvec![selected],
      })
   }

   fn audio_event(device: Address, props: &Properties) -> Option<StackEvent> {
      let state = match prop_str(props, "State")? {
         "active" => RawAudioState::Started,
         "idle" => RawAudioState::Stopped,
         _ => return None,
      };
      Some(StackEvent::AudioStateChanged { state, device })
   }

   fn properties_changed(
      &mut self,
      path: &str,
      iface: &str,
      changed: &Properties,
   ) -> Vec<StackEvent> {
      let mut events = Vec::new();
      if !on_adapter(path, &self.adapter_path) {
         return events;
      }

      match iface {
         ADAPTER_IFACE if path == self.adapter_path => {
            if let Some(powered) = prop_bool(changed, "Powered") {
               info!("Adapter {} powered: {powered}", self.adapter_path);
               self.policy.set_adapter_present(powered);
            }
         },
         DEVICE_IFACE => {
            let Some(device) = Address::from_object_path(path) else {
               return events;
            };
            self.update_device(device, changed);
            let audio_device = self.devices.get(&device).is_some_and(|d| d.sink)
               || self.has_transport(device);
            if prop_bool(changed, "Connected") == Some(false) && audio_device {
               events.push(StackEvent::ConnectionStateChanged {
                  state: RawConnectionState::Disconnected,
                  device,
               });
            }
         },
         TRANSPORT_IFACE => {
            let Some(device) = Address::from_object_path(path) else {
               return events;
            };
            let codec = self.transports.entry(path.to_owned()).or_default();
            if let Some(id) = prop_u8(changed, "Codec") {
               *codec = Some(id);
            }
            events.extend(Self::codec_event(*codec, changed));
            events.extend(Self::audio_event(device, changed));
         },
         _ => {},
      }
      events
   }

   fn interfaces_added(&mut self, path: &str, interfaces: &Interfaces) -> Vec<StackEvent> {
      let mut events = Vec::new();
      if !on_adapter(path, &self.adapter_path) {
         return events;
      }

      if path == self.adapter_path
         && let Some(props) = interfaces.get(ADAPTER_IFACE)
      {
         self
            .policy
            .set_adapter_present(prop_bool(props, "Powered").unwrap_or(true));
      }

      let Some(device) = Address::from_object_path(path) else {
         return events;
      };
      if let Some(props) = interfaces.get(DEVICE_IFACE) {
         self.update_device(device, props);
      }
      if let Some(props) = interfaces.get(TRANSPORT_IFACE) {
         let codec = prop_u8(props, "Codec");
         self.transports.insert(path.to_owned(), codec);
         events.push(StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Connected,
            device,
         });
         events.extend(Self::codec_event(codec, props));
         if prop_str(props, "State") == Some("active") {
            events.push(StackEvent::AudioStateChanged { state: RawAudioState::Started, device });
         }
      }
      events
   }

   fn interfaces_removed(&mut self, path: &str, interfaces: &[String]) -> Vec<StackEvent> {
      if !on_adapter(path, &self.adapter_path) {
         return vec![];
      }
      let removed = |name: &str| interfaces.iter().any(|i| i == name);

      if path == self.adapter_path && removed(ADAPTER_IFACE) {
         warn!("Adapter {} removed", self.adapter_path);
         self.policy.set_adapter_present(false);
      }
      let Some(device) = Address::from_object_path(path) else {
         return vec![];
      };
      if removed(DEVICE_IFACE) {
         self.devices.remove(&device);
      }
      if removed(TRANSPORT_IFACE) {
         self.transports.remove(path);
         return vec![StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Disconnected,
            device,
         }];
      }
      vec![]
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::RwLock;
   use zbus::zvariant::ObjectPath;

   use super::*;
   use crate::{
      a2dp::{
         MachineState, ProfileState,
         codec::{CODEC_PRIORITY_DEFAULT, CodecType, bits_per_sample, channel_mode, sample_rate},
      },
      bluetooth::policy::{ConnectPolicy, fake::StaticPolicy},
      config::Config,
   };

   const ADAPTER: &str = "/org/bluez/hci0";
   const DEV: Address = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const DEV_PATH: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";
   const MOUSE_PATH: &str = "/org/bluez/hci0/dev_66_77_88_99_AA_BB";
   const TRANSPORT: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55/sep1/fd0";

   fn monitor() -> Monitor {
      Monitor::new(
         ADAPTER.to_owned(),
         Arc::new(ConfigPolicy::from_config(&Config::default())),
      )
   }

   fn properties_signal(path: &str, iface: &str, changed: HashMap<&str, Value<'_>>) -> Message {
      Message::signal(path, "org.freedesktop.DBus.Properties", "PropertiesChanged")
         .unwrap()
         .build(&(iface, changed, Vec::<String>::new()))
         .unwrap()
   }

   fn added_signal(path: &str, interfaces: HashMap<&str, HashMap<&str, Value<'_>>>) -> Message {
      Message::signal("/", "org.freedesktop.DBus.ObjectManager", "InterfacesAdded")
         .unwrap()
         .build(&(ObjectPath::try_from(path).unwrap(), interfaces))
         .unwrap()
   }

   fn sink_device(m: &mut Monitor, path: &str) {
      let props = HashMap::from([
         ("UUIDs", Value::from(vec![A2DP_SINK_UUID.to_string()])),
         ("Paired", Value::from(true)),
      ]);
      m.translate(&added_signal(path, HashMap::from([(DEVICE_IFACE, props)])))
         .unwrap();
   }

   fn sbc(rate: u32) -> CodecConfig {
      CodecConfig::new(CodecType::Sbc, CODEC_PRIORITY_DEFAULT).with_feeding(
         rate,
         bits_per_sample::BITS_16,
         channel_mode::STEREO,
      )
   }

   fn codec_changed(selected: CodecConfig) -> StackEvent {
      StackEvent::CodecConfigChanged {
         selected,
         local_capabilities: smallvec![selected],
         selectable_capabilities: smallvec![selected],
      }
   }

   #[test]
   fn test_transport_state_maps_to_audio_state() {
      let mut m = monitor();
      let msg = properties_signal(
         TRANSPORT,
         TRANSPORT_IFACE,
         HashMap::from([("State", Value::from("active"))]),
      );
      assert_eq!(m.translate(&msg).unwrap(), vec![StackEvent::AudioStateChanged {
         state: RawAudioState::Started,
         device: DEV,
      }]);

      let msg = properties_signal(
         TRANSPORT,
         TRANSPORT_IFACE,
         HashMap::from([("State", Value::from("pending"))]),
      );
      assert!(m.translate(&msg).unwrap().is_empty());
   }

   #[test]
   fn test_sink_link_loss_and_pairing() {
      let mut m = monitor();
      sink_device(&mut m, DEV_PATH);
      assert!(m.policy.is_bonded(&DEV));

      let msg = properties_signal(
         DEV_PATH,
         DEVICE_IFACE,
         HashMap::from([("Connected", Value::from(false)), ("Paired", Value::from(false))]),
      );
      assert_eq!(m.translate(&msg).unwrap(), vec![StackEvent::ConnectionStateChanged {
         state: RawConnectionState::Disconnected,
         device: DEV,
      }]);
      assert!(!m.policy.is_bonded(&DEV));
   }

   #[test]
   fn test_non_audio_device_link_loss_is_ignored() {
      let mut m = monitor();
      let mouse = Address::from_object_path(MOUSE_PATH).unwrap();
      let msg = properties_signal(
         MOUSE_PATH,
         DEVICE_IFACE,
         HashMap::from([("Paired", Value::from(true)), ("Connected", Value::from(false))]),
      );
      assert!(m.translate(&msg).unwrap().is_empty());
      assert!(!m.policy.is_bonded(&mouse));
      assert!(m.policy.bonded_sinks().is_empty());
   }

   #[test]
   fn test_transport_added_means_connected() {
      let mut m = monitor();
      let interfaces = HashMap::from([(
         TRANSPORT_IFACE,
         HashMap::from([("State", Value::from("idle"))]),
      )]);
      assert_eq!(m.translate(&added_signal(TRANSPORT, interfaces)).unwrap(), vec![
         StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Connected,
            device: DEV,
         }
      ]);
   }

   #[test]
   fn test_transport_reports_codec_configuration() {
      let mut m = monitor();
      let interfaces = HashMap::from([(
         TRANSPORT_IFACE,
         HashMap::from([
            ("Codec", Value::from(media::CODEC_SBC)),
            ("Configuration", Value::from(vec![0x21u8, 0x15, 2, 53])),
            ("State", Value::from("idle")),
         ]),
      )]);
      assert_eq!(m.translate(&added_signal(TRANSPORT, interfaces)).unwrap(), vec![
         StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Connected,
            device: DEV,
         },
         codec_changed(sbc(sample_rate::HZ_44100)),
      ]);

      // reconfiguration carries only the blob, the codec id is remembered
      let msg = properties_signal(
         TRANSPORT,
         TRANSPORT_IFACE,
         HashMap::from([("Configuration", Value::from(vec![0x12u8, 0x15, 2, 53]))]),
      );
      assert_eq!(m.translate(&msg).unwrap(), vec![codec_changed(sbc(sample_rate::HZ_48000))]);
   }

   #[test]
   fn test_device_with_transport_link_loss() {
      let mut m = monitor();
      let transport = Interfaces::from([(TRANSPORT_IFACE.to_owned(), Properties::new())]);
      m.interfaces_added(TRANSPORT, &transport);
      let lost = OwnedValue::try_from(Value::from(false)).unwrap();
      let events = m.properties_changed(
         DEV_PATH,
         DEVICE_IFACE,
         &Properties::from([("Connected".to_owned(), lost)]),
      );
      assert_eq!(events, vec![StackEvent::ConnectionStateChanged {
         state: RawConnectionState::Disconnected,
         device: DEV,
      }]);
   }

   #[test]
   fn test_other_adapter_is_ignored() {
      let mut m = monitor();
      let msg = properties_signal(
         "/org/bluez/hci1",
         ADAPTER_IFACE,
         HashMap::from([("Powered", Value::from(true))]),
      );
      assert!(m.translate(&msg).unwrap().is_empty());
      assert!(!m.policy.has_adapter_service());

      let msg = properties_signal(
         ADAPTER,
         ADAPTER_IFACE,
         HashMap::from([("Powered", Value::from(true))]),
      );
      m.translate(&msg).unwrap();
      assert!(m.policy.has_adapter_service());
   }

   #[test]
   fn test_adapter_and_transport_removal() {
      let mut m = monitor();
      m.policy.set_adapter_present(true);

      let events = m.interfaces_removed(TRANSPORT, &[TRANSPORT_IFACE.to_owned()]);
      assert_eq!(events, vec![StackEvent::ConnectionStateChanged {
         state: RawConnectionState::Disconnected,
         device: DEV,
      }]);

      assert!(m.interfaces_removed(ADAPTER, &[ADAPTER_IFACE.to_owned()]).is_empty());
      assert!(!m.policy.has_adapter_service());
   }

   fn query(state: ProfileState) -> ConnectionQuery {
      ConnectionQuery::new(Arc::new(RwLock::new(state)), Arc::new(StaticPolicy::accepting()))
   }

   #[test]
   fn test_failed_disconnect_reported_only_while_tearing_down() {
      let tearing_down = query(ProfileState {
         machine: MachineState::Pending,
         current: Some(DEV),
         ..Default::default()
      });
      assert_eq!(
         disconnect_failed(&tearing_down, DEV),
         Some(StackEvent::ConnectionStateChanged {
            state: RawConnectionState::Connected,
            device: DEV,
         })
      );

      // a rejected link is untracked, reporting it again would reject it forever
      assert_eq!(disconnect_failed(&query(ProfileState::default()), DEV), None);

      let rejected_incoming = query(ProfileState {
         machine: MachineState::Pending,
         incoming: Some(DEV),
         ..Default::default()
      });
      assert_eq!(disconnect_failed(&rejected_incoming, DEV), None);
   }
}
