//! Parsing of `ideviceinfo` style `key: value` output.
//!
//! The device-info tool prints one property per line, e.g.
//!
//! ```text
//! DeviceName: Ayşe's iPhone
//! ProductType: iPhone14,2
//! ProductVersion: 17.4.1
//! ```
//!
//! Values may themselves contain colons (MAC addresses), so lines are split on
//! the first colon only.

use std::collections::HashMap;

use crate::error::Error;

/// Bytes per gigabyte. Decimal, matching how device vendors report capacity.
pub const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Parses a `key: value` block into a map.
///
/// Lines without a colon, and lines with an empty key, are skipped.
/// Later duplicates overwrite earlier ones.
pub fn parse_key_value_block(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Returns the non-empty value for `key`, if any.
pub fn text_field(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parses an unsigned integer field.
///
/// Returns `Ok(None)` when the key is absent and `Err(ParseAnomaly)` when the
/// value is present but not a number.
pub fn u64_field(fields: &HashMap<String, String>, key: &str) -> Result<Option<u64>, Error> {
    match text_field(fields, key) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::ParseAnomaly {
                key: key.to_string(),
                value,
            }),
    }
}

/// Parses a `true`/`false` field.
pub fn bool_field(fields: &HashMap<String, String>, key: &str) -> Result<Option<bool>, Error> {
    match text_field(fields, key) {
        None => Ok(None),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(Error::ParseAnomaly {
                key: key.to_string(),
                value,
            }),
        },
    }
}

/// Converts a byte count to decimal gigabytes.
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Maps a hardware product code (e.g. `iPhone14,2`) to its marketing name.
///
/// Unknown codes are returned unchanged.
pub fn friendly_model_name(product_code: &str) -> String {
    MODEL_NAMES
        .iter()
        .find(|(code, _)| *code == product_code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| product_code.to_string())
}

const MODEL_NAMES: &[(&str, &str)] = &[
    // iPhone
    ("iPhone8,1", "iPhone 6s"),
    ("iPhone8,2", "iPhone 6s Plus"),
    ("iPhone8,4", "iPhone SE"),
    ("iPhone9,1", "iPhone 7"),
    ("iPhone9,3", "iPhone 7"),
    ("iPhone9,2", "iPhone 7 Plus"),
    ("iPhone9,4", "iPhone 7 Plus"),
    ("iPhone10,1", "iPhone 8"),
    ("iPhone10,4", "iPhone 8"),
    ("iPhone10,2", "iPhone 8 Plus"),
    ("iPhone10,5", "iPhone 8 Plus"),
    ("iPhone10,3", "iPhone X"),
    ("iPhone10,6", "iPhone X"),
    ("iPhone11,2", "iPhone XS"),
    ("iPhone11,4", "iPhone XS Max"),
    ("iPhone11,6", "iPhone XS Max"),
    ("iPhone11,8", "iPhone XR"),
    ("iPhone12,1", "iPhone 11"),
    ("iPhone12,3", "iPhone 11 Pro"),
    ("iPhone12,5", "iPhone 11 Pro Max"),
    ("iPhone12,8", "iPhone SE (2nd generation)"),
    ("iPhone13,1", "iPhone 12 mini"),
    ("iPhone13,2", "iPhone 12"),
    ("iPhone13,3", "iPhone 12 Pro"),
    ("iPhone13,4", "iPhone 12 Pro Max"),
    ("iPhone14,4", "iPhone 13 mini"),
    ("iPhone14,5", "iPhone 13"),
    ("iPhone14,2", "iPhone 13 Pro"),
    ("iPhone14,3", "iPhone 13 Pro Max"),
    ("iPhone14,6", "iPhone SE (3rd generation)"),
    ("iPhone14,7", "iPhone 14"),
    ("iPhone14,8", "iPhone 14 Plus"),
    ("iPhone15,2", "iPhone 14 Pro"),
    ("iPhone15,3", "iPhone 14 Pro Max"),
    ("iPhone15,4", "iPhone 15"),
    ("iPhone15,5", "iPhone 15 Plus"),
    ("iPhone16,1", "iPhone 15 Pro"),
    ("iPhone16,2", "iPhone 15 Pro Max"),
    ("iPhone17,3", "iPhone 16"),
    ("iPhone17,4", "iPhone 16 Plus"),
    ("iPhone17,1", "iPhone 16 Pro"),
    ("iPhone17,2", "iPhone 16 Pro Max"),
    ("iPhone17,5", "iPhone 16e"),
    // iPad
    ("iPad7,5", "iPad (6th generation)"),
    ("iPad7,6", "iPad (6th generation)"),
    ("iPad7,11", "iPad (7th generation)"),
    ("iPad7,12", "iPad (7th generation)"),
    ("iPad11,6", "iPad (8th generation)"),
    ("iPad11,7", "iPad (8th generation)"),
    ("iPad12,1", "iPad (9th generation)"),
    ("iPad12,2", "iPad (9th generation)"),
    ("iPad13,18", "iPad (10th generation)"),
    ("iPad13,19", "iPad (10th generation)"),
    ("iPad11,3", "iPad Air (3rd generation)"),
    ("iPad11,4", "iPad Air (3rd generation)"),
    ("iPad13,1", "iPad Air (4th generation)"),
    ("iPad13,2", "iPad Air (4th generation)"),
    ("iPad13,16", "iPad Air (5th generation)"),
    ("iPad13,17", "iPad Air (5th generation)"),
    ("iPad11,1", "iPad mini (5th generation)"),
    ("iPad11,2", "iPad mini (5th generation)"),
    ("iPad14,1", "iPad mini (6th generation)"),
    ("iPad14,2", "iPad mini (6th generation)"),
    ("iPad13,4", "iPad Pro 11-inch (3rd generation)"),
    ("iPad13,8", "iPad Pro 12.9-inch (5th generation)"),
    ("iPad14,3", "iPad Pro 11-inch (4th generation)"),
    ("iPad14,5", "iPad Pro 12.9-inch (6th generation)"),
    // iPod
    ("iPod7,1", "iPod touch (6th generation)"),
    ("iPod9,1", "iPod touch (7th generation)"),
];

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INFO: &str = "ActivationState: Activated
BluetoothAddress: 6c:4a:85:12:34:56
BuildVersion: 21E236
DeviceName: Test iPhone
HardwareModel: D63AP
ProductType: iPhone14,2
ProductVersion: 17.4.1
SerialNumber: F2LXK0ABCDEF
WiFiAddress: 6c:4a:85:12:34:55
";

    #[test]
    fn test_parse_key_value_block() {
        let fields = parse_key_value_block(SAMPLE_INFO);

        assert_eq!(fields.len(), 9);
        assert_eq!(fields["DeviceName"], "Test iPhone");
        assert_eq!(fields["ProductType"], "iPhone14,2");
        // Split on first colon only
        assert_eq!(fields["WiFiAddress"], "6c:4a:85:12:34:55");
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(parse_key_value_block("").is_empty());
        assert!(parse_key_value_block("\n\n   \n").is_empty());
        assert!(parse_key_value_block("no colon here\nanother line").is_empty());
        assert!(parse_key_value_block(": value without key").is_empty());
        assert!(parse_key_value_block("ERROR Could not connect to lockdownd").is_empty());
    }

    #[test]
    fn test_parse_trims_and_keeps_empty_values() {
        let fields = parse_key_value_block("  DeviceName  :   Phone  \r\nPasswordProtected:\n");
        assert_eq!(fields["DeviceName"], "Phone");
        assert_eq!(fields["PasswordProtected"], "");
        assert_eq!(text_field(&fields, "PasswordProtected"), None);
    }

    #[test]
    fn test_numeric_fields() {
        let fields =
            parse_key_value_block("TotalDataCapacity: 118000000000\nBatteryIsCharging: false\nBroken: 12x");

        assert_eq!(
            u64_field(&fields, "TotalDataCapacity").unwrap(),
            Some(118_000_000_000)
        );
        assert_eq!(u64_field(&fields, "Missing").unwrap(), None);
        assert!(matches!(
            u64_field(&fields, "Broken"),
            Err(Error::ParseAnomaly { .. })
        ));
        assert_eq!(bool_field(&fields, "BatteryIsCharging").unwrap(), Some(false));
    }

    #[test]
    fn test_bytes_to_gb_is_decimal() {
        assert_eq!(bytes_to_gb(128_000_000_000), 128.0);
        assert_eq!(bytes_to_gb(0), 0.0);
    }

    #[test]
    fn test_friendly_model_name() {
        assert_eq!(friendly_model_name("iPhone14,2"), "iPhone 13 Pro");
        assert_eq!(friendly_model_name("iPad13,18"), "iPad (10th generation)");
        // Unknown codes pass through
        assert_eq!(friendly_model_name("iPhone99,9"), "iPhone99,9");
        assert_eq!(friendly_model_name(""), "");
    }
}
