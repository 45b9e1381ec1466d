//! A2DP sink profile daemon for BlueZ
//!
//! This service tracks the A2DP link to one remote audio sink at a time,
//! arbitrates connect and disconnect requests against the stack's own
//! reports, and publishes connection, playback and codec changes on the
//! session bus.

use std::sync::Arc;

use log::info;
use tokio::{runtime::Handle, signal};
use zbus::{Connection, connection};

use a2dp::{broadcaster::ConnectionStateBroadcaster, profile::A2dpProfile};
use bluetooth::{bluez::BluezBridge, policy::ConfigPolicy};
use dbus::{DbusSink, OBJECT_PATH, ProfileService, SERVICE_NAME};
use power::{LogindWakeLock, NoopWakeLock, WakeLock};

mod a2dp;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod power;

use crate::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting a2dpd...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.devices.len()
   );

   let system = Connection::system().await?;
   let policy = Arc::new(ConfigPolicy::from_config(&config));

   let wake_lock: Arc<dyn WakeLock> = if config.inhibit_sleep {
      Arc::new(LogindWakeLock::new(system.clone(), Handle::current()))
   } else {
      Arc::new(NoopWakeLock)
   };
   let broadcaster = ConnectionStateBroadcaster::new(wake_lock);

   // Bring up the profile on top of BlueZ
   let bridge = Arc::new(BluezBridge::new(
      system.clone(),
      config.adapter.clone(),
      Handle::current(),
   ));
   let profile = Arc::new(A2dpProfile::make(
      &config,
      bridge.clone(),
      policy.clone(),
      broadcaster.clone(),
   ));
   bridge
      .spawn_monitor(profile.stack_events(), profile.query().clone(), policy.clone())
      .await?;

   // Build D-Bus connection
   let service = ProfileService::new(profile.clone(), policy);
   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("a2dpd D-Bus service started at {SERVICE_NAME}");

   broadcaster.spawn_dispatcher(DbusSink::new(&connection).await?);

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down a2dpd...");

   profile.quit().await?;
   profile.cleanup();

   Ok(())
}
