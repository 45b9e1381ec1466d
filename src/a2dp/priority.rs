//! Codec priority resolution.
//!
//! Builds the ordered codec table handed to the native stack at startup,
//! and the reduced preference lists used to toggle optional codecs.

use log::debug;
use serde::{Deserialize, Serialize};

use super::codec::{
   CODEC_PRIORITY_DEFAULT, CODEC_PRIORITY_DISABLED, CODEC_PRIORITY_HIGHEST, CODEC_TYPE_COUNT,
   CodecConfig, CodecType,
};

/// Per-codec priority overrides, usually read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPriorityOverrides {
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub sbc: Option<i32>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub aac: Option<i32>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub aptx: Option<i32>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub aptx_hd: Option<i32>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub ldac: Option<i32>,
}

impl CodecPriorityOverrides {
   pub const fn get(&self, codec: CodecType) -> Option<i32> {
      match codec {
         CodecType::Sbc => self.sbc,
         CodecType::Aac => self.aac,
         CodecType::Aptx => self.aptx,
         CodecType::AptxHd => self.aptx_hd,
         CodecType::Ldac => self.ldac,
      }
   }
}

/// Codec preference list sent to the native stack. Never longer than the
/// number of codec types.
pub type CodecPreferences = heapless::Vec<CodecConfig, CODEC_TYPE_COUNT>;

/// The fixed five-slot table, in [`CodecType::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecPriorityTable([CodecConfig; CODEC_TYPE_COUNT]);

impl CodecPriorityTable {
   pub fn as_slice(&self) -> &[CodecConfig] {
      &self.0
   }

   pub fn get(&self, codec: CodecType) -> &CodecConfig {
      &self.0[codec as usize]
   }

   pub fn iter(&self) -> impl ExactSizeIterator<Item = &CodecConfig> {
      self.0.iter()
   }
}

/// Accepts a configured priority only if it lies in `[DISABLED, HIGHEST)`.
const fn clamp_priority(value: Option<i32>) -> i32 {
   match value {
      Some(v) if v >= CODEC_PRIORITY_DISABLED && v < CODEC_PRIORITY_HIGHEST => v,
      _ => CODEC_PRIORITY_DEFAULT,
   }
}

/// Resolves configured overrides into the codec priority table.
#[derive(Debug, Clone)]
pub struct CodecPriorityResolver {
   overrides: CodecPriorityOverrides,
   table: CodecPriorityTable,
}

impl CodecPriorityResolver {
   pub fn new(overrides: CodecPriorityOverrides) -> Self {
      let table = Self::resolve(&overrides);
      Self { overrides, table }
   }

   pub fn resolve(overrides: &CodecPriorityOverrides) -> CodecPriorityTable {
      CodecPriorityTable(CodecType::ALL.map(|codec| {
         let priority = clamp_priority(overrides.get(codec));
         if overrides.get(codec).is_some_and(|v| v != priority) {
            debug!("Ignoring out-of-range {codec} priority, using default");
         }
         CodecConfig::new(codec, priority)
      }))
   }

   /// Table computed at construction, used for native initialization.
   pub const fn table(&self) -> &CodecPriorityTable {
      &self.table
   }

   /// Preferences that let the stack negotiate optional codecs again: only
   /// the mandatory codec is pushed, at its resolved priority.
   pub fn enable_optional_codecs(&self) -> CodecPreferences {
      self.mandatory_only().collect()
   }

   /// Preferences that pin the stack to the mandatory codec.
   pub fn disable_optional_codecs(&self) -> CodecPreferences {
      self
         .mandatory_only()
         .map(|cfg| CodecConfig { priority: CODEC_PRIORITY_HIGHEST, ..cfg })
         .collect()
   }

   fn mandatory_only(&self) -> impl Iterator<Item = CodecConfig> {
      Self::resolve(&self.overrides)
         .0
         .into_iter()
         .filter(CodecConfig::is_mandatory_codec)
   }
}
