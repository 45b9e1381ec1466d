use std::{str::FromStr, sync::Arc};

use log::info;
use zbus::{
   Connection, fdo, interface,
   object_server::{InterfaceRef, SignalEmitter},
};

use crate::{
   a2dp::{
      ConnectionState,
      codec::{CodecConfig, CodecType},
      profile::A2dpProfile,
   },
   bluetooth::{
      address::Address,
      policy::{ConfigPolicy, ConnectionPriority},
   },
   error::{A2dpError, Result},
   event::{Broadcast, BroadcastSink},
};

pub const SERVICE_NAME: &str = "org.a2dpd";
pub const OBJECT_PATH: &str = "/org/a2dpd/profile";

fn parse_address(address: &str) -> fdo::Result<Address> {
   Address::from_str(address).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}

pub struct ProfileService {
   profile: Arc<A2dpProfile>,
   policy: Arc<ConfigPolicy>,
}

impl ProfileService {
   pub const fn new(profile: Arc<A2dpProfile>, policy: Arc<ConfigPolicy>) -> Self {
      Self { profile, policy }
   }
}

#[interface(name = "org.a2dpd.Profile")]
impl ProfileService {
   async fn connect(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .profile
         .connect(addr)
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .profile
         .disconnect(addr)
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn get_connection_state(&self, address: String) -> fdo::Result<String> {
      let addr = parse_address(&address)?;
      Ok(self.profile.query().connection_state(&addr).to_string())
   }

   async fn get_connected_devices(&self) -> Vec<String> {
      self
         .profile
         .query()
         .connected_devices()
         .iter()
         .map(ToString::to_string)
         .collect()
   }

   async fn get_devices_matching_states(&self, states: Vec<String>) -> fdo::Result<Vec<String>> {
      let states = states
         .iter()
         .map(|s| ConnectionState::from_str(s))
         .collect::<std::result::Result<Vec<_>, _>>()
         .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
      Ok(self
         .profile
         .query()
         .devices_matching_states(&states)
         .iter()
         .map(ToString::to_string)
         .collect())
   }

   async fn is_playing(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      Ok(self.profile.query().is_playing(&addr))
   }

   /// JSON object, or `null` before the stack has reported a codec.
   async fn get_codec_status(&self) -> String {
      self
         .profile
         .query()
         .codec_status()
         .map_or(serde_json::Value::Null, |s| s.to_json())
         .to_string()
   }

   async fn set_codec_config_preference(&self, codec: String, priority: i32) -> fdo::Result<bool> {
      let codec_type = CodecType::from_str(&codec).map_err(|_| {
         fdo::Error::InvalidArgs(A2dpError::UnknownCodec(codec.clone()).to_string())
      })?;
      self
         .profile
         .set_codec_config_preference(CodecConfig::new(codec_type, priority))
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn enable_optional_codecs(&self) -> fdo::Result<bool> {
      self
         .profile
         .enable_optional_codecs()
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn disable_optional_codecs(&self) -> fdo::Result<bool> {
      self
         .profile
         .disable_optional_codecs()
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn set_quiet_mode(&self, enabled: bool) {
      info!("Quiet mode {}", if enabled { "on" } else { "off" });
      self.policy.set_quiet_mode(enabled);
   }

   async fn set_device_priority(&self, address: String, priority: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let priority = ConnectionPriority::from_str(&priority)
         .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
      self.policy.set_priority(addr, priority);
      Ok(true)
   }

   async fn dump(&self) -> String {
      self.profile.query().dump()
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      previous: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn playing_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      previous: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn codec_config_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      status: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self.profile.query().machine_state().to_string()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.profile.query().connected_devices().len() as u32
   }
}

/// Delivers broadcasts as signals on the profile object.
pub struct DbusSink {
   iface: InterfaceRef<ProfileService>,
}

impl DbusSink {
   pub async fn new(connection: &Connection) -> Result<Self> {
      let iface = connection
         .object_server()
         .interface::<_, ProfileService>(OBJECT_PATH)
         .await?;
      Ok(Self { iface })
   }

   /// Connection changes move both `State` and `ConnectedCount`.
   async fn refresh_properties(&self) -> Result<()> {
      let emitter = self.iface.signal_emitter();
      let service = self.iface.get().await;
      service.state_changed(emitter).await?;
      service.connected_count_changed(emitter).await?;
      Ok(())
   }
}

impl BroadcastSink for DbusSink {
   async fn deliver(&self, broadcast: Broadcast) -> Result<()> {
      let addr_str = broadcast.device().to_string();
      match broadcast {
         Broadcast::ConnectionStateChanged { previous, state, .. } => {
            self
               .iface
               .connection_state_changed(&addr_str, &previous.to_string(), &state.to_string())
               .await?;
            self.refresh_properties().await?;
         },
         Broadcast::PlayingStateChanged { previous, state, .. } => {
            self
               .iface
               .playing_state_changed(&addr_str, &previous.to_string(), &state.to_string())
               .await?;
         },
         Broadcast::CodecConfigChanged { status, .. } => {
            self
               .iface
               .codec_config_changed(&addr_str, &status.to_json().to_string())
               .await?;
         },
      }
      Ok(())
   }
}
