//! Configuration management for the A2DP daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including codec priority overrides and known sink devices.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   a2dp::priority::CodecPriorityOverrides,
   bluetooth::policy::ConnectionPriority,
   error::{A2dpError, Result},
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default = "default_adapter")]
   pub adapter: SmolStr,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default)]
   pub quiet_mode: bool,

   /// Hold a logind sleep inhibitor while connection changes are delivered.
   #[serde(default = "default_inhibit_sleep")]
   pub inhibit_sleep: bool,

   #[serde(default)]
   pub codec_priorities: CodecPriorityOverrides,

   #[serde(default)]
   pub devices: Vec<KnownDevice>,
}

/// A sink device with a stored profile priority.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   #[serde(default)]
   pub name: SmolStr,
   #[serde(default)]
   pub priority: ConnectionPriority,
   #[serde(default)]
   pub bonded: bool,
}

fn default_adapter() -> SmolStr {
   SmolStr::new_static("hci0")
}

const fn default_connect_timeout() -> u64 {
   30
}

const fn default_inhibit_sleep() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: default_adapter(),
         connect_timeout_sec: default_connect_timeout(),
         quiet_mode: false,
         inhibit_sleep: default_inhibit_sleep(),
         codec_priorities: CodecPriorityOverrides::default(),
         devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("A2DP_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(A2dpError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("a2dpd").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }
}
