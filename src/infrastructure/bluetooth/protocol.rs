//! Peripheral Protocol
//!
//! Attribute identifiers, descriptor payloads and the little bit of
//! advertisement/value decoding the link core needs. Anything richer
//! belongs to the transport layer.

use crate::domain::models::{Advertisement, AttributeId, DescriptorId};
use anyhow::Result;
use tracing::trace;
use uuid::Uuid;

/// Battery Level characteristic (0x2A19), one byte, percent
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CONFIG_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that turns notifications on
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// AD types carrying a local name
const AD_TYPE_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

pub fn battery_level_attribute() -> AttributeId {
    AttributeId(BATTERY_LEVEL_UUID)
}

/// Parse a textual UUID (hyphenated or not) into an attribute id
pub fn parse_attribute_id(uuid_str: &str) -> Result<AttributeId> {
    let uuid = Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))?;
    Ok(AttributeId(uuid))
}

/// The configuration descriptor that controls notifications for `attribute`
pub fn client_config_descriptor(attribute: AttributeId) -> DescriptorId {
    DescriptorId {
        attribute,
        descriptor: CLIENT_CONFIG_UUID,
    }
}

/// Decode a Battery Level value. The first byte is the percentage.
pub fn parse_battery_level(value: &[u8]) -> Option<u8> {
    let level = *value.first()?;
    trace!("Battery level payload: {:02X?}", value);
    Some(level.min(100))
}

/// Extract a complete or shortened local name from raw advertisement data
///
/// # Advertisement Data Layout
///
/// ```text
/// [len][type][data ... (len - 1 bytes)] [len][type][data ...] ...
/// ```
///
/// Parsing stops at the first zero length or truncated structure.
pub fn extract_local_name(data: &[u8]) -> Option<String> {
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        let ad_type = data[i + 1];
        if ad_type == AD_TYPE_COMPLETE_LOCAL_NAME || ad_type == AD_TYPE_SHORTENED_LOCAL_NAME {
            let name_bytes = &data[i + 2..i + 1 + len];
            let name = String::from_utf8_lossy(name_bytes).trim().to_string();
            return if name.is_empty() { None } else { Some(name) };
        }
        i += len + 1;
    }
    None
}

/// Name to show for an advertisement: the platform name, else the one embedded in its payload
pub fn resolve_display_name(advertisement: &Advertisement) -> Option<String> {
    advertisement
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| extract_local_name(&advertisement.payload))
}

/// Case-insensitive "contains" match of a display name against a target pattern
pub fn name_matches(name: &str, pattern: &str) -> bool {
    name.to_lowercase().contains(&pattern.to_lowercase())
}
