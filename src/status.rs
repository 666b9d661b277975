//! Parser for `quectel show device state <id>` output.
//!
//! The engine prints a loose `Key : Value` table whose exact row set varies
//! by firmware; the parser scans line by line, splits on the first colon and
//! keeps the keys it knows. Missing rows leave defaults — a partial status is
//! never an error.

use serde::Serialize;

/// Structured snapshot of one modem as reported by the telephony engine.
#[derive(Debug, Clone, Serialize)]
pub struct ModemStatus {
    /// Raw `State` value: `Free`, `Not initialized`, `Not found`, ...
    pub state: String,
    /// Signal strength on the 0–31 scale; 0 means no signal.
    pub rssi: i32,
    pub registered: bool,
    pub provider: Option<String>,
    pub voice: bool,
    pub sms: bool,
    /// Whether the configuration asks for VoLTE on this modem.
    pub volte_enabled: bool,
    /// Whether VoLTE is observed active (filled in from the VoLTE controller).
    pub volte_active: bool,
    pub error: Option<String>,
}

impl Default for ModemStatus {
    fn default() -> Self {
        Self {
            state: "Unknown".to_string(),
            rssi: 0,
            registered: false,
            provider: None,
            voice: false,
            sms: false,
            volte_enabled: false,
            volte_active: false,
            error: None,
        }
    }
}

impl ModemStatus {
    /// Whether the engine does not know this device at all. Reads both the
    /// state and the error text because either side can carry the signal.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.state == "Not found"
            || self
                .error
                .as_deref()
                .is_some_and(|e| e.to_lowercase().contains("not found"))
    }
}

/// Parse the multi-line output of `quectel show device state <id>`.
#[must_use]
pub fn parse_device_state(output: &str) -> ModemStatus {
    let mut status = ModemStatus::default();
    let trimmed = output.trim();

    if trimmed.contains("No such device") {
        status.state = "Not found".to_string();
        status.error = Some("Device not found in Asterisk".to_string());
        return status;
    }

    // CLI-level failures (connection refused, timeouts) are not modem state.
    if trimmed.starts_with("Error") || trimmed.contains("Unable") {
        status.error = Some(trimmed.to_string());
        return status;
    }

    for line in trimmed.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "State" => status.state = value.to_string(),
            "RSSI" => {
                if let Some(n) = first_integer(value) {
                    status.rssi = n;
                }
            }
            "GSM Registration Status" => status.registered = value.contains("Registered"),
            "Provider Name" | "Network Name" => {
                if status.provider.is_none() && !value.is_empty() && value != "Unknown" {
                    status.provider = Some(value.to_string());
                }
            }
            "Voice" => status.voice = value == "Yes",
            "SMS" => status.sms = value == "Yes",
            _ => {}
        }
    }

    status
}

/// First run of ASCII digits in `value`, e.g. `"18, 3.0 dBm"` → 18.
fn first_integer(value: &str) -> Option<i32> {
    value
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTHY: &str = "\
-------------- Status --------------
State                   : Free
RSSI                    : 18, -77 dBm
GSM Registration Status : Registered, home network
Provider Name           : TestTel
Voice                   : Yes
SMS                     : Yes";

    #[test]
    fn test_parse_healthy_device() {
        let s = parse_device_state(HEALTHY);
        assert_eq!(s.state, "Free");
        assert_eq!(s.rssi, 18);
        assert!(s.registered);
        assert_eq!(s.provider.as_deref(), Some("TestTel"));
        assert!(s.voice);
        assert!(s.sms);
        assert!(s.error.is_none());
    }

    #[test]
    fn test_parse_no_such_device() {
        let s = parse_device_state("No such device 'modem-9'");
        assert_eq!(s.state, "Not found");
        assert_eq!(s.error.as_deref(), Some("Device not found in Asterisk"));
        assert!(s.is_not_found());
    }

    #[test]
    fn test_parse_cli_failure_is_not_modem_state() {
        let s = parse_device_state("Unable to connect to remote asterisk");
        assert_eq!(s.state, "Unknown");
        assert!(s.error.is_some());
        assert!(!s.is_not_found());
    }

    #[test]
    fn test_parse_unknown_provider_ignored() {
        let s = parse_device_state("State : Free\nProvider Name : Unknown\nNetwork Name : RealNet");
        assert_eq!(s.provider.as_deref(), Some("RealNet"));
    }

    #[test]
    fn test_parse_provider_first_wins() {
        let s = parse_device_state("Provider Name : First\nNetwork Name : Second");
        assert_eq!(s.provider.as_deref(), Some("First"));
    }

    #[test]
    fn test_parse_not_initialized() {
        let s = parse_device_state("State : Not initialized\nRSSI : 0");
        assert_eq!(s.state, "Not initialized");
        assert_eq!(s.rssi, 0);
    }

    #[test]
    fn test_parse_missing_rows_keep_defaults() {
        let s = parse_device_state("Something Else : 42");
        assert_eq!(s.state, "Unknown");
        assert_eq!(s.rssi, 0);
        assert!(!s.registered);
        assert!(s.provider.is_none());
    }

    #[test]
    fn test_first_integer() {
        assert_eq!(first_integer("18, -77 dBm"), Some(18));
        assert_eq!(first_integer("no digits"), None);
        assert_eq!(first_integer("0"), Some(0));
    }

    #[test]
    fn test_error_text_not_found_flavored() {
        let s = ModemStatus {
            error: Some("Device not found in Asterisk".to_string()),
            ..ModemStatus::default()
        };
        assert!(s.is_not_found());
    }
}
