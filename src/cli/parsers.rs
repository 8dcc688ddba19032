//! Shared CLI argument parsers.

use std::time::Duration;

use catapult_node::config::MAX_INTERFACE_NAME_LEN;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a host network interface name, such as a bridge.
pub fn parse_interface_name(s: &str) -> Result<String, String> {
    if s.is_empty() {
        return Err("interface name cannot be empty".to_string());
    }
    if s.len() > MAX_INTERFACE_NAME_LEN {
        return Err(format!(
            "interface name too long: {} characters (max {})",
            s.len(),
            MAX_INTERFACE_NAME_LEN
        ));
    }
    if s.contains('/') || s.contains(char::is_whitespace) {
        return Err(format!("invalid interface name: {:?}", s));
    }
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_interface_name() {
        assert_eq!(parse_interface_name("fcbridge").unwrap(), "fcbridge");
        assert!(parse_interface_name("").is_err());
        assert!(parse_interface_name("br 0").is_err());
        assert!(parse_interface_name("a/b").is_err());
        assert!(parse_interface_name("a-very-long-bridge").is_err());
    }
}
