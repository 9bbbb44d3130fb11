//! GATT data model shared by the engine
//!
//! Characteristic identity, declared properties, completion status codes and
//! the Client Characteristic Configuration (CCC) values used to subscribe.

use anyhow::Result;
use std::fmt;
use uuid::Uuid;

/// Client Characteristic Configuration descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = short_uuid(0x2902);

/// CCC values
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Parse a UUID string, accepting either the full form or a 16-bit short form
/// ("2a37" / "0x2A37").
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let trimmed = uuid_str.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if short.len() == 4 {
        let value = u16::from_str_radix(short, 16)?;
        return Ok(short_uuid(value));
    }

    Uuid::parse_str(trimmed).map_err(|e| anyhow::anyhow!("Invalid UUID format: {}", e))
}

/// Declared characteristic properties (Bluetooth SIG bit values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// An addressable GATT endpoint as discovered on the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    pub const fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }

    /// Writes without response complete locally and produce no callback.
    pub fn write_type(&self) -> WriteType {
        if !self.properties.contains(CharacteristicProperties::WRITE)
            && self
                .properties
                .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }

    /// CCC value that subscribes to this characteristic. Notify wins when
    /// both are declared.
    pub fn subscription_value(&self) -> Option<[u8; 2]> {
        if self.properties.contains(CharacteristicProperties::NOTIFY) {
            Some(ENABLE_NOTIFICATION_VALUE)
        } else if self.properties.contains(CharacteristicProperties::INDICATE) {
            Some(ENABLE_INDICATION_VALUE)
        } else {
            None
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// ATT status code carried by completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const FAILURE: Self = Self(0x85);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "success")
        } else {
            write!(f, "failed: {:#04x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            short_uuid(0x2902).to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(parse_uuid("0x2A37").unwrap(), short_uuid(0x2a37));
        assert_eq!(
            parse_uuid("c8c51726-81bc-483b-a052-f7a14ea3d281")
                .unwrap()
                .as_u128()
                >> 96,
            0xc8c51726
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_subscription_value_prefers_notify() {
        let both = Characteristic::new(
            short_uuid(0x2a37),
            CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE,
        );
        assert_eq!(both.subscription_value(), Some(ENABLE_NOTIFICATION_VALUE));

        let indicate_only =
            Characteristic::new(short_uuid(0x2a05), CharacteristicProperties::INDICATE);
        assert_eq!(
            indicate_only.subscription_value(),
            Some(ENABLE_INDICATION_VALUE)
        );

        let read_only = Characteristic::new(short_uuid(0x2a19), CharacteristicProperties::READ);
        assert_eq!(read_only.subscription_value(), None);
    }

    #[test]
    fn test_write_type() {
        let no_rsp = Characteristic::new(
            short_uuid(0xfff1),
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        );
        assert_eq!(no_rsp.write_type(), WriteType::WithoutResponse);

        let both = Characteristic::new(
            short_uuid(0xfff2),
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        );
        assert_eq!(both.write_type(), WriteType::WithResponse);
    }
}
