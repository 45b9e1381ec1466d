//! A2DP source codec configuration types.
//!
//! These mirror the values exchanged with the native stack: one
//! [`CodecConfig`] per codec, carrying a priority plus the negotiated
//! feeding parameters (sample rate, bit depth and channel mode).

use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;

/// Number of source codec types known to the native stack.
pub const CODEC_TYPE_COUNT: usize = 5;

/// Priority of a disabled codec.
pub const CODEC_PRIORITY_DISABLED: i32 = -1;
/// Priority used when no override is configured.
pub const CODEC_PRIORITY_DEFAULT: i32 = 0;
/// Highest priority; configured values must stay strictly below it.
pub const CODEC_PRIORITY_HIGHEST: i32 = 1000 * 1000;

/// Source codec types, in native table order.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CodecType {
   Sbc = 0,
   Aac = 1,
   Aptx = 2,
   AptxHd = 3,
   Ldac = 4,
}

impl CodecType {
   pub const ALL: [Self; CODEC_TYPE_COUNT] =
      [Self::Sbc, Self::Aac, Self::Aptx, Self::AptxHd, Self::Ldac];

   /// SBC is the only codec every A2DP sink must support.
   pub const fn is_mandatory(self) -> bool {
      matches!(self, Self::Sbc)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Bitmask of sample rates.
pub mod sample_rate {
   pub const NONE: u32 = 0;
   pub const HZ_44100: u32 = 0x01;
   pub const HZ_48000: u32 = 0x02;
   pub const HZ_88200: u32 = 0x04;
   pub const HZ_96000: u32 = 0x08;
   pub const HZ_176400: u32 = 0x10;
   pub const HZ_192000: u32 = 0x20;
}

/// Bitmask of sample widths.
pub mod bits_per_sample {
   pub const NONE: u32 = 0;
   pub const BITS_16: u32 = 0x01;
   pub const BITS_24: u32 = 0x02;
   pub const BITS_32: u32 = 0x04;
}

/// Bitmask of channel modes.
pub mod channel_mode {
   pub const NONE: u32 = 0;
   pub const MONO: u32 = 0x01;
   pub const STEREO: u32 = 0x02;
}

/// One codec configuration, as selected or offered by the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
   pub codec_type: CodecType,
   pub priority: i32,
   pub sample_rate: u32,
   pub bits_per_sample: u32,
   pub channel_mode: u32,
   #[serde(default)]
   pub codec_specific: [i64; 4],
}

impl CodecConfig {
   /// A priority-only entry with no feeding parameters set.
   pub const fn new(codec_type: CodecType, priority: i32) -> Self {
      Self {
         codec_type,
         priority,
         sample_rate: sample_rate::NONE,
         bits_per_sample: bits_per_sample::NONE,
         channel_mode: channel_mode::NONE,
         codec_specific: [0; 4],
      }
   }

   pub const fn with_feeding(mut self, sample_rate: u32, bits_per_sample: u32, channel_mode: u32) -> Self {
      self.sample_rate = sample_rate;
      self.bits_per_sample = bits_per_sample;
      self.channel_mode = channel_mode;
      self
   }

   pub const fn is_mandatory_codec(&self) -> bool {
      self.codec_type.is_mandatory()
   }

   /// Whether the audio pipeline can keep feeding with the same parameters.
   ///
   /// A missing previous configuration never matches.
   pub fn same_audio_feeding_parameters(&self, other: Option<&Self>) -> bool {
      other.is_some_and(|o| {
         o.sample_rate == self.sample_rate
            && o.bits_per_sample == self.bits_per_sample
            && o.channel_mode == self.channel_mode
      })
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "codec": self.codec_type.to_str(),
         "priority": self.priority,
         "sample_rate": self.sample_rate,
         "bits_per_sample": self.bits_per_sample,
         "channel_mode": self.channel_mode,
         "codec_specific": self.codec_specific,
      })
   }
}

pub type Capabilities = SmallVec<[CodecConfig; CODEC_TYPE_COUNT]>;

/// Snapshot of the codec negotiation last reported by the native stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecStatus {
   pub selected: CodecConfig,
   pub local_capabilities: Capabilities,
   pub selectable_capabilities: Capabilities,
}

impl CodecStatus {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "selected": self.selected.to_json(),
         "local_capabilities": self.local_capabilities.iter().map(CodecConfig::to_json).collect::<Vec<_>>(),
         "selectable_capabilities": self.selectable_capabilities.iter().map(CodecConfig::to_json).collect::<Vec<_>>(),
      })
   }
}
