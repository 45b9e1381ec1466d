//! A2DP media codec configuration blobs, as BlueZ exposes them on
//! `MediaTransport1` through the `Codec` and `Configuration` properties.

use crate::a2dp::codec::{
   CODEC_PRIORITY_DEFAULT, CodecConfig, CodecType, bits_per_sample, channel_mode, sample_rate,
};

pub const CODEC_SBC: u8 = 0x00;
pub const CODEC_MPEG24: u8 = 0x02;
pub const CODEC_VENDOR: u8 = 0xFF;

const APTX_VENDOR_ID: u32 = 0x0000_004F;
const APTX_CODEC_ID: u16 = 0x0001;
const APTX_HD_VENDOR_ID: u32 = 0x0000_00D7;
const APTX_HD_CODEC_ID: u16 = 0x0024;
const LDAC_VENDOR_ID: u32 = 0x0000_012D;
const LDAC_CODEC_ID: u16 = 0x00AA;

/// Decodes the configuration selected for a transport.
///
/// Returns `None` for codecs outside [`CodecType`] and for truncated blobs.
pub fn parse_configuration(codec: u8, config: &[u8]) -> Option<CodecConfig> {
   let (codec_type, rate, bits, channels) = match codec {
      CODEC_SBC => sbc(config)?,
      CODEC_MPEG24 => aac(config)?,
      CODEC_VENDOR => vendor(config)?,
      _ => return None,
   };
   Some(CodecConfig::new(codec_type, CODEC_PRIORITY_DEFAULT).with_feeding(rate, bits, channels))
}

type Feeding = (CodecType, u32, u32, u32);

fn sbc(config: &[u8]) -> Option<Feeding> {
   if config.len() < 4 {
      return None;
   }
   let rate = match config[0] & 0xF0 {
      0x20 => sample_rate::HZ_44100,
      0x10 => sample_rate::HZ_48000,
      _ => sample_rate::NONE,
   };
   let channels = match config[0] & 0x0F {
      0x08 => channel_mode::MONO,
      0x04 | 0x02 | 0x01 => channel_mode::STEREO,
      _ => channel_mode::NONE,
   };
   Some((CodecType::Sbc, rate, bits_per_sample::BITS_16, channels))
}

fn aac(config: &[u8]) -> Option<Feeding> {
   if config.len() < 6 {
      return None;
   }
   let rate = if config[1] & 0x01 != 0 {
      sample_rate::HZ_44100
   } else {
      match config[2] & 0xF0 {
         0x80 => sample_rate::HZ_48000,
         0x20 => sample_rate::HZ_88200,
         0x10 => sample_rate::HZ_96000,
         _ => sample_rate::NONE,
      }
   };
   let channels = match config[2] & 0x0C {
      0x08 => channel_mode::MONO,
      0x04 => channel_mode::STEREO,
      _ => channel_mode::NONE,
   };
   Some((CodecType::Aac, rate, bits_per_sample::BITS_16, channels))
}

fn vendor(config: &[u8]) -> Option<Feeding> {
   let vendor_id = u32::from_le_bytes(config.get(0..4)?.try_into().ok()?);
   let codec_id = u16::from_le_bytes(config.get(4..6)?.try_into().ok()?);
   let payload = config.get(6..)?;

   match (vendor_id, codec_id) {
      (APTX_VENDOR_ID, APTX_CODEC_ID) => {
         let (rate, channels) = aptx_feeding(*payload.first()?);
         Some((CodecType::Aptx, rate, bits_per_sample::BITS_16, channels))
      },
      (APTX_HD_VENDOR_ID, APTX_HD_CODEC_ID) => {
         let (rate, channels) = aptx_feeding(*payload.first()?);
         Some((CodecType::AptxHd, rate, bits_per_sample::BITS_24, channels))
      },
      (LDAC_VENDOR_ID, LDAC_CODEC_ID) => {
         let rate = match *payload.first()? & 0x3F {
            0x20 => sample_rate::HZ_44100,
            0x10 => sample_rate::HZ_48000,
            0x08 => sample_rate::HZ_88200,
            0x04 => sample_rate::HZ_96000,
            0x02 => sample_rate::HZ_176400,
            0x01 => sample_rate::HZ_192000,
            _ => sample_rate::NONE,
         };
         let channels = match *payload.get(1)? & 0x07 {
            0x04 => channel_mode::MONO,
            0x02 | 0x01 => channel_mode::STEREO,
            _ => channel_mode::NONE,
         };
         Some((CodecType::Ldac, rate, bits_per_sample::BITS_32, channels))
      },
      _ => None,
   }
}

fn aptx_feeding(byte: u8) -> (u32, u32) {
   let rate = match byte & 0xF0 {
      0x20 => sample_rate::HZ_44100,
      0x10 => sample_rate::HZ_48000,
      _ => sample_rate::NONE,
   };
   let channels = match byte & 0x0F {
      0x01 => channel_mode::MONO,
      0x02 => channel_mode::STEREO,
      _ => channel_mode::NONE,
   };
   (rate, channels)
}
