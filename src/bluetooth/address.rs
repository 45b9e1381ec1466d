//! Bluetooth device addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::A2dpError;

/// A 48-bit Bluetooth device address (`BD_ADDR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
   pub const fn new(addr: [u8; 6]) -> Self {
      Self(addr)
   }

   /// Extracts the device address from a BlueZ object path such as
   /// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1/fd0`.
   pub fn from_object_path(path: &str) -> Option<Self> {
      let segment = path.split('/').find_map(|s| s.strip_prefix("dev_"))?;
      segment.replace('_', ":").parse().ok()
   }

   /// BlueZ object path of this device on the given adapter.
   pub fn object_path(&self, adapter: &str) -> String {
      let [a, b, c, d, e, f] = self.0;
      format!("/org/bluez/{adapter}/dev_{a:02X}_{b:02X}_{c:02X}_{d:02X}_{e:02X}_{f:02X}")
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for Address {
   type Err = A2dpError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || A2dpError::InvalidAddress(s.to_string());
      if s.len() != 17 {
         return Err(invalid());
      }

      let mut bytes = [0u8; 6];
      let mut octets = s.split(':');
      for byte in &mut bytes {
         let octet = octets.next().ok_or_else(invalid)?;
         if octet.len() != 2 {
            return Err(invalid());
         }
         *byte = u8::from_str_radix(octet, 16).map_err(|_| invalid())?;
      }
      if octets.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(bytes))
   }
}

impl From<[u8; 6]> for Address {
   fn from(addr: [u8; 6]) -> Self {
      Self(addr)
   }
}

impl Serialize for Address {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Address {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_and_format() {
      let addr: Address = "0a:b1:2C:D3:4e:F5".parse().unwrap();
      assert_eq!(addr.0, [0x0A, 0xB1, 0x2C, 0xD3, 0x4E, 0xF5]);
      assert_eq!(addr.to_string(), "0A:B1:2C:D3:4E:F5");
   }

   #[test]
   fn test_parse_rejects_malformed() {
      for bad in [
         "",
         "00:11:22:33:44",
         "00:11:22:33:44:55:66",
         "00-11-22-33-44-55",
         "0:011:22:33:44:55",
         "GG:11:22:33:44:55",
      ] {
         assert!(bad.parse::<Address>().is_err(), "accepted {bad:?}");
      }
   }

   #[test]
   fn test_object_path() {
      let addr = Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
      let path = addr.object_path("hci0");
      assert_eq!(path, "/org/bluez/hci0/dev_00_1A_7D_DA_71_13");
      assert_eq!(Address::from_object_path(&path), Some(addr));
      assert_eq!(
         Address::from_object_path("/org/bluez/hci0/dev_00_1A_7D_DA_71_13/sep1/fd3"),
         Some(addr)
      );
      assert_eq!(Address::from_object_path("/org/bluez/hci0"), None);
   }

   #[test]
   fn test_serde_as_string() {
      let addr = Address::new([1, 2, 3, 4, 5, 6]);
      let json = serde_json::to_string(&addr).unwrap();
      assert_eq!(json, "\"01:02:03:04:05:06\"");
      let back: Address = serde_json::from_str(&json).unwrap();
      assert_eq!(back, addr);
   }
}
