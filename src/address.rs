//! Transport address of a peripheral.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::LinkError;

/// A 48-bit device address, written as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 6]);

impl Address {
   pub const fn new(octets: [u8; 6]) -> Self {
      Self(octets)
   }

   pub const fn octets(&self) -> [u8; 6] {
      self.0
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for Address {
   type Err = LinkError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || LinkError::InvalidAddress(SmolStr::new(s));
      if s.len() != 17 {
         return Err(invalid());
      }

      let mut octets = [0u8; 6];
      let mut parts = s.split(':');
      for octet in &mut octets {
         let part = parts.next().ok_or_else(invalid)?;
         if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
         }
         *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(octets))
   }
}

impl TryFrom<String> for Address {
   type Error = LinkError;

   fn try_from(value: String) -> Result<Self, Self::Error> {
      value.parse()
   }
}

impl From<Address> for String {
   fn from(value: Address) -> Self {
      value.to_string()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_and_display() {
      let addr: Address = "0c:1a:2B:3c:4D:5e".parse().unwrap();
      assert_eq!(addr.octets(), [0x0C, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
      assert_eq!(addr.to_string(), "0C:1A:2B:3C:4D:5E");
   }

   #[test]
   fn test_rejects_malformed() {
      for bad in [
         "invalid-address",
         "",
         "00:11:22:33:44",
         "00:11:22:33:44:55:66",
         "00-11-22-33-44-55",
         "00:11:22:33:44:GG",
         "0:011:22:33:44:55",
      ] {
         let err = bad.parse::<Address>().unwrap_err();
         assert!(err.is_validation(), "{bad} => {err}");
      }
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
