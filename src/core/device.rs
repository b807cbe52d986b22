//! Device identity.
//!
//! A device is identified by a small integer id carried in every frame
//! header. The id is derived from the numeric suffix of the device's
//! advertised radio name, which the discovery layer supplies.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Small integer id of a device, unique within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Derive a device id from an advertised name's trailing decimal
    /// digits, e.g. `"ranger-7"` -> 7.
    ///
    /// Returns `None` if the name has no decimal suffix or the suffix does
    /// not fit the id byte.
    pub fn from_advertised_name(name: &str) -> Option<Self> {
        let digits: String = name
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if digits.is_empty() {
            return None;
        }
        digits.parse::<u8>().ok().map(DeviceId)
    }

    /// Raw id byte.
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u8> for DeviceId {
    fn from(id: u8) -> Self {
        DeviceId(id)
    }
}

/// Current wall-clock time as nanoseconds since the UNIX epoch.
///
/// Software timestamps on the wire use this clock; capture timestamps use
/// the radio's capture clock and never mix with it inside one subtraction.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffix() {
        assert_eq!(
            DeviceId::from_advertised_name("ranger-7"),
            Some(DeviceId(7))
        );
        assert_eq!(
            DeviceId::from_advertised_name("node12"),
            Some(DeviceId(12))
        );
        assert_eq!(DeviceId::from_advertised_name("42"), Some(DeviceId(42)));
    }

    #[test]
    fn test_parse_no_suffix() {
        assert_eq!(DeviceId::from_advertised_name("ranger"), None);
        assert_eq!(DeviceId::from_advertised_name(""), None);
    }

    #[test]
    fn test_parse_suffix_overflow() {
        // 300 does not fit the id byte
        assert_eq!(DeviceId::from_advertised_name("ranger-300"), None);
    }

    #[test]
    fn test_now_ns_monotonic_enough() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
