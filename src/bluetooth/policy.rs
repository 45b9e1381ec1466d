//! Adapter and per-device inputs for accepting A2DP links.

use std::{
   collections::HashMap,
   sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::address::Address,
   config::{Config, KnownDevice},
};

/// Stored connection priority of a device for this profile.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionPriority {
   /// Never negotiated; SDP has probably not completed yet.
   #[default]
   Undefined,
   Off,
   On,
   AutoConnect,
}

impl ConnectionPriority {
   pub const fn is_above_off(self) -> bool {
      matches!(self, Self::On | Self::AutoConnect)
   }
}

/// What the connection state machine needs to know about the adapter
/// and the remote device before accepting a link.
pub trait ConnectPolicy: Send + Sync {
   /// Whether the adapter service backing this profile is up.
   fn has_adapter_service(&self) -> bool;

   fn is_quiet_mode(&self) -> bool;

   fn priority(&self, device: &Address) -> ConnectionPriority;

   fn is_bonded(&self, device: &Address) -> bool;

   /// Bonded devices advertising the audio sink service.
   fn bonded_sinks(&self) -> Vec<Address>;
}

#[derive(Debug, Clone, Default)]
struct DeviceRecord {
   priority: ConnectionPriority,
   bonded: bool,
}

/// Policy backed by the config file, updated at runtime by the BlueZ
/// monitor and the D-Bus service.
pub struct ConfigPolicy {
   adapter_present: AtomicBool,
   quiet_mode: AtomicBool,
   devices: RwLock<HashMap<Address, DeviceRecord>>,
}

impl ConfigPolicy {
   pub fn from_config(config: &Config) -> Self {
      let devices = config
         .devices
         .iter()
         .filter_map(|KnownDevice { address, priority, bonded, .. }| {
            let addr = address.parse().ok()?;
            Some((addr, DeviceRecord { priority: *priority, bonded: *bonded }))
         })
         .collect();
      Self {
         adapter_present: AtomicBool::new(false),
         quiet_mode: AtomicBool::new(config.quiet_mode),
         devices: RwLock::new(devices),
      }
   }

   pub fn set_adapter_present(&self, present: bool) {
      self.adapter_present.store(present, Ordering::Relaxed);
   }

   pub fn set_quiet_mode(&self, enabled: bool) {
      self.quiet_mode.store(enabled, Ordering::Relaxed);
   }

   pub fn set_bonded(&self, device: Address, bonded: bool) {
      self.devices.write().entry(device).or_default().bonded = bonded;
   }

   pub fn set_priority(&self, device: Address, priority: ConnectionPriority) {
      self.devices.write().entry(device).or_default().priority = priority;
   }
}

impl ConnectPolicy for ConfigPolicy {
   fn has_adapter_service(&self) -> bool {
      self.adapter_present.load(Ordering::Relaxed)
   }

   fn is_quiet_mode(&self) -> bool {
      self.quiet_mode.load(Ordering::Relaxed)
   }

   fn priority(&self, device: &Address) -> ConnectionPriority {
      self
         .devices
         .read()
         .get(device)
         .map(|d| d.priority)
         .unwrap_or_default()
   }

   fn is_bonded(&self, device: &Address) -> bool {
      self.devices.read().get(device).is_some_and(|d| d.bonded)
   }

   fn bonded_sinks(&self) -> Vec<Address> {
      let mut sinks: Vec<_> = self
         .devices
         .read()
         .iter()
         .filter(|(_, d)| d.bonded)
         .map(|(addr, _)| *addr)
         .collect();
      sinks.sort_unstable();
      sinks
   }
}

#[cfg(test)]
pub mod fake {
   use super::*;

   /// Same answer for every device.
   pub struct StaticPolicy {
      pub service: AtomicBool,
      pub quiet: AtomicBool,
      pub priority: RwLock<ConnectionPriority>,
      pub bonded: AtomicBool,
      pub sinks: Vec<Address>,
   }

   impl StaticPolicy {
      pub fn accepting() -> Self {
         Self {
            service: AtomicBool::new(true),
            quiet: AtomicBool::new(false),
            priority: RwLock::new(ConnectionPriority::On),
            bonded: AtomicBool::new(true),
            sinks: Vec::new(),
         }
      }

      pub fn rejecting() -> Self {
         let policy = Self::accepting();
         *policy.priority.write() = ConnectionPriority::Off;
         policy
      }
   }

   impl ConnectPolicy for StaticPolicy {
      fn has_adapter_service(&self) -> bool {
         self.service.load(Ordering::Relaxed)
      }

      fn is_quiet_mode(&self) -> bool {
         self.quiet.load(Ordering::Relaxed)
      }

      fn priority(&self, _device: &Address) -> ConnectionPriority {
         *self.priority.read()
      }

      fn is_bonded(&self, _device: &Address) -> bool {
         self.bonded.load(Ordering::Relaxed)
      }

      fn bonded_sinks(&self) -> Vec<Address> {
         self.sinks.clone()
      }
   }
}
