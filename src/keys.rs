//! Registry key, channel and shared-memory region names
//!
//! Every name that crosses a process boundary is built here so producers and
//! consumers can never disagree on the keyspace.

/// Set of every registered device name.
pub const DEVICES_SET: &str = "cameras";

/// Wildcard token accepted for device types and picture names.
pub const WILDCARD: &str = "*";

/// `{type}.{index}`, e.g. `daheng.0`.
pub fn device_name(device_type: &str, index: u32) -> String {
    format!("{}.{}", device_type, index)
}

pub fn command_channel(device: &str) -> String {
    format!("cameras/{}/command", device)
}

/// Set of picture names published by a device.
pub fn pictures_set(device: &str) -> String {
    format!("cameras/{}/pictures", device)
}

/// Key of one picture field (`width`, `height`, `id`, ...).
pub fn picture_field(device: &str, picture: &str, field: &str) -> String {
    format!("cameras/{}/pictures/{}/{}", device, picture, field)
}

pub fn status_field(device: &str, field: &str) -> String {
    format!("cameras/{}/status/{}", device, field)
}

/// Prefix of every configuration entry of a device, with the trailing slash.
pub fn configuration_prefix(device: &str) -> String {
    format!("configurations/{}/", device)
}

pub fn configuration_entry(device: &str, name: &str) -> String {
    format!("configurations/{}/{}", device, name)
}

/// `{device}.{picture}.{chain_index}`.
pub fn region_name(device: &str, picture: &str, chain_index: u32) -> String {
    format!("{}.{}.{}", device, picture, chain_index)
}

/// Picture field names.
pub mod field {
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const CHANNELS: &str = "channels";
    pub const FORMAT: &str = "format";
    pub const BLOCKS: &str = "blocks";
    pub const ID: &str = "id";
    pub const TIMESTAMP: &str = "timestamp";

    /// Every field a producer owns for one picture.
    pub const ALL: [&str; 7] = [WIDTH, HEIGHT, CHANNELS, FORMAT, BLOCKS, ID, TIMESTAMP];
}

/// Status field names.
pub mod status {
    pub const FPS: &str = "fps";
    pub const HEARTBEAT: &str = "heartbeat";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_follow_keyspace() {
        let device = device_name("daheng", 0);
        assert_eq!(device, "daheng.0");
        assert_eq!(command_channel(&device), "cameras/daheng.0/command");
        assert_eq!(pictures_set(&device), "cameras/daheng.0/pictures");
        assert_eq!(
            picture_field(&device, "main", field::WIDTH),
            "cameras/daheng.0/pictures/main/width"
        );
        assert_eq!(status_field(&device, status::FPS), "cameras/daheng.0/status/fps");
        assert_eq!(
            configuration_entry(&device, "Exposure"),
            "configurations/daheng.0/Exposure"
        );
        assert!(configuration_entry(&device, "Gain").starts_with(&configuration_prefix(&device)));
        assert_eq!(region_name(&device, "main", 3), "daheng.0.main.3");
    }
}
