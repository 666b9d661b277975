//! VoLTE audio-path control for EC25-class modems.
//!
//! A modem runs in one of two audio modes: the standard handset path, or
//! USB-audio (UAC) with voice carried over LTE. Switching is a fixed AT
//! sequence sent over the modem's serial data port — never through the
//! engine-queued CLI, whose echoed responses are unreliable for `?` queries.
//!
//! `AT+QAUDMOD` and `AT+QPCMV` do not persist across a modem reboot, so the
//! supervisor calls [`VolteController::initialize`] after every disruptive
//! recovery that re-enumerated the device.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::asterisk::AsteriskControl;
use crate::clock::Clock;
use crate::config::ModemConfig;

/// Cached status entries go stale after this.
const STATUS_TTL_MS: u64 = 30_000;
/// Per-query serial timeout.
const AT_TIMEOUT_SECS: u64 = 3;
/// Settle time after each toggle command.
const SETTLE_MS: u64 = 500;
/// Extra wait for IMS registration after an activation sequence.
const IMS_WAIT_MS: u64 = 3_000;
/// Reinitialization: device-table poll period and overall window.
const REINIT_POLL_MS: u64 = 2_000;
const REINIT_WINDOW_MS: u64 = 60_000;
/// Reinitialization: settle time once the device shows up Free.
const REINIT_STABILIZE_MS: u64 = 3_000;

const ACTIVATE_SEQUENCE: [&str; 6] = [
    "AT+QCFG=\"nwscanmode\",3",
    "AT+QCFG=\"ims\",1",
    "AT+QMBNCFG=\"Select\",\"ROW_Generic_3GPP\"",
    "AT+CGDCONT=2,\"IPV4V6\",\"ims\"",
    "AT+QAUDMOD=3",
    "AT+QPCMV=1,2",
];

const DEACTIVATE_SEQUENCE: [&str; 3] = [
    "AT+QCFG=\"nwscanmode\",0",
    "AT+QAUDMOD=0",
    "AT+QPCMV=1,0",
];

/// Radio access technology as reported by the `<rat>` tail of `AT+COPS?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Lte,
    Umts,
    Gsm,
    Other,
}

/// Observed VoLTE state of one modem.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VolteStatus {
    pub ims_enabled: Option<bool>,
    pub ims_registered: Option<bool>,
    pub network_mode: Option<NetworkMode>,
    /// `AT+QAUDMOD?` value: 3 = UAC, 0 = handset.
    pub audio_mode: Option<i32>,
    /// `AT+QPCMV?` enable flag — whether the voice path runs over UAC.
    pub voice_over_uac: Option<bool>,
    /// `AT+QPCMV?` mode: 2 = UAC, 0 = TTY.
    pub pcm_mode: Option<i32>,
    /// Derived: the modem is *configured* for VoLTE.
    pub volte_enabled: bool,
    /// Derived: VoLTE is actually usable right now.
    pub volte_active: bool,
    pub error: Option<String>,
}

impl VolteStatus {
    /// A status is meaningful when at least one defining register was read.
    /// Only meaningful statuses are worth caching.
    #[must_use]
    pub fn meaningful(&self) -> bool {
        self.ims_enabled.is_some() || self.audio_mode.is_some()
    }

    fn derive(&mut self) {
        self.volte_enabled = self.ims_enabled == Some(true) || self.audio_mode == Some(3);
        let lte_voice =
            self.voice_over_uac == Some(true) && self.network_mode == Some(NetworkMode::Lte);
        self.volte_active =
            self.volte_enabled && (lte_voice || self.ims_registered == Some(true));
    }
}

/// Outcome of a toggle or reinitialization.
#[derive(Debug, Clone, Serialize)]
pub struct VolteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub status: Option<VolteStatus>,
}

impl VolteResult {
    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            warning: None,
            status: None,
        }
    }
}

struct CacheEntry {
    status: VolteStatus,
    at_ms: u64,
}

pub struct VolteController<A, C> {
    asterisk: Arc<A>,
    clock: Arc<C>,
    modems: HashMap<String, ModemConfig>,
    cache: tokio::sync::Mutex<HashMap<String, CacheEntry>>,
}

impl<A: AsteriskControl, C: Clock> VolteController<A, C> {
    #[must_use]
    pub fn new(modems: &[ModemConfig], asterisk: Arc<A>, clock: Arc<C>) -> Self {
        Self {
            asterisk,
            clock,
            modems: modems.iter().map(|m| (m.id.clone(), m.clone())).collect(),
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Current VoLTE status, served from cache when younger than the TTL
    /// unless `force_refresh`.
    pub async fn get_status(&self, modem_id: &str, force_refresh: bool) -> VolteStatus {
        if !force_refresh {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(modem_id) {
                if self.clock.now_ms().saturating_sub(cached.at_ms) < STATUS_TTL_MS {
                    return cached.status.clone();
                }
            }
        }

        let Some(modem) = self.modems.get(modem_id) else {
            return VolteStatus {
                error: Some(format!("unknown modem '{modem_id}'")),
                ..VolteStatus::default()
            };
        };

        let status = self.query(modem).await;
        if status.meaningful() {
            self.cache.lock().await.insert(
                modem_id.to_string(),
                CacheEntry {
                    status: status.clone(),
                    at_ms: self.clock.now_ms(),
                },
            );
        }
        status
    }

    async fn query(&self, modem: &ModemConfig) -> VolteStatus {
        let port = &modem.data_port;
        let mut status = VolteStatus::default();

        let ims = self
            .asterisk
            .send_at_direct(port, "AT+QCFG=\"ims\"", AT_TIMEOUT_SECS)
            .await;
        if let Some((enabled, registered)) = parse_qcfg_ims(&ims) {
            status.ims_enabled = Some(enabled);
            status.ims_registered = Some(registered);
        }

        let cops = self
            .asterisk
            .send_at_direct(port, "AT+COPS?", AT_TIMEOUT_SECS)
            .await;
        status.network_mode = parse_cops_rat(&cops);

        let audio = self
            .asterisk
            .send_at_direct(port, "AT+QAUDMOD?", AT_TIMEOUT_SECS)
            .await;
        status.audio_mode = parse_qaudmod(&audio);

        let pcm = self
            .asterisk
            .send_at_direct(port, "AT+QPCMV?", AT_TIMEOUT_SECS)
            .await;
        if let Some((enabled, mode)) = parse_qpcmv(&pcm) {
            status.voice_over_uac = Some(enabled);
            status.pcm_mode = Some(mode);
        }

        if !status.meaningful() {
            status.error = Some(format!("no usable AT response from {port} ({})", ims.trim()));
        }
        status.derive();
        debug!(
            "{}: volte status ims={:?}/{:?} rat={:?} audio={:?} pcm={:?}/{:?} → enabled={} active={}",
            modem.id,
            status.ims_enabled,
            status.ims_registered,
            status.network_mode,
            status.audio_mode,
            status.voice_over_uac,
            status.pcm_mode,
            status.volte_enabled,
            status.volte_active,
        );
        status
    }

    /// Switch the audio path and invalidate the cached status.
    pub async fn toggle(&self, modem_id: &str, enable: bool) -> VolteResult {
        let Some(modem) = self.modems.get(modem_id) else {
            return VolteResult::fail(format!("unknown modem '{modem_id}'"));
        };

        self.cache.lock().await.remove(modem_id);
        info!(
            "{modem_id}: {} VoLTE audio path",
            if enable { "activating" } else { "deactivating" }
        );

        let sequence: &[&str] = if enable {
            &ACTIVATE_SEQUENCE
        } else {
            &DEACTIVATE_SEQUENCE
        };

        let mut failed = Vec::new();
        for cmd in sequence {
            let resp = self
                .asterisk
                .send_at_direct(&modem.data_port, cmd, AT_TIMEOUT_SECS)
                .await;
            if resp.starts_with("Error") || resp.contains("ERROR") {
                warn!("{modem_id}: {cmd} failed: {}", resp.trim());
                failed.push(*cmd);
            }
            self.clock.sleep_ms(SETTLE_MS).await;
        }
        if enable {
            self.clock.sleep_ms(IMS_WAIT_MS).await;
        }

        let status = self.get_status(modem_id, true).await;
        let mut result = VolteResult {
            success: false,
            error: None,
            warning: None,
            status: Some(status.clone()),
        };

        if enable {
            result.success = status.volte_enabled;
            if !result.success {
                result.error = Some(if failed.is_empty() {
                    "activation did not take effect".to_string()
                } else {
                    format!("activation failed at: {}", failed.join(", "))
                });
            } else if status.ims_registered != Some(true) {
                result.warning = Some("IMS not registered yet".to_string());
            }
        } else {
            // The deactivation sequence leaves IMS config alone, so judge by
            // the audio path only.
            result.success = status.audio_mode.is_none_or(|m| m != 3);
            if !result.success {
                result.error = Some("audio path still in UAC mode".to_string());
            }
        }
        result
    }

    /// Re-apply the audio-path configuration after a disruptive recovery.
    ///
    /// Waits for the device to re-enumerate and report `Free`, settles, then
    /// runs the activation sequence when the config asks for VoLTE.
    pub async fn initialize(&self, modem_id: &str) -> VolteResult {
        let Some(modem) = self.modems.get(modem_id) else {
            return VolteResult::fail(format!("unknown modem '{modem_id}'"));
        };

        info!("{modem_id}: waiting for device to come back after reset");
        let deadline = self.clock.now_ms() + REINIT_WINDOW_MS;
        loop {
            let table = self.asterisk.list_devices().await;
            if device_is_free(&table, modem_id) {
                break;
            }
            if self.clock.now_ms() >= deadline {
                warn!("{modem_id}: not Free within {}s", REINIT_WINDOW_MS / 1000);
                return VolteResult::fail(format!(
                    "{modem_id} did not come back Free within {}s",
                    REINIT_WINDOW_MS / 1000
                ));
            }
            self.clock.sleep_ms(REINIT_POLL_MS).await;
        }
        self.clock.sleep_ms(REINIT_STABILIZE_MS).await;

        if modem.volte_enabled {
            self.toggle(modem_id, true).await
        } else {
            let status = self.get_status(modem_id, true).await;
            VolteResult {
                success: true,
                error: None,
                warning: None,
                status: Some(status),
            }
        }
    }
}

/// Whether the device table lists `modem_id` in the `Free` state.
fn device_is_free(table: &str, modem_id: &str) -> bool {
    table
        .lines()
        .any(|line| line.contains(modem_id) && line.contains("Free"))
}

/// `+QCFG: "ims",<enabled>[,<registered>]`
fn parse_qcfg_ims(response: &str) -> Option<(bool, bool)> {
    let line = response
        .lines()
        .find(|l| l.contains("+QCFG:") && l.contains("ims"))?;
    let data = line.split(':').nth(1)?;
    let parts: Vec<&str> = data.split(',').map(str::trim).collect();
    let enabled = parts.get(1)?.parse::<i32>().ok()?;
    let registered = parts
        .get(2)
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(0);
    Some((enabled == 1, registered == 1))
}

/// `+COPS: <mode>,<format>,"<operator>",<rat>` — only the full four-field
/// form carries the access technology.
fn parse_cops_rat(response: &str) -> Option<NetworkMode> {
    let line = response.lines().find(|l| l.contains("+COPS:"))?;
    let data = line.split(':').nth(1)?.trim();
    let parts: Vec<&str> = data.split(',').collect();
    if parts.len() < 4 {
        return None;
    }
    let rat = parts.last()?.trim().parse::<i32>().ok()?;
    Some(match rat {
        7 => NetworkMode::Lte,
        2 => NetworkMode::Umts,
        0 => NetworkMode::Gsm,
        _ => NetworkMode::Other,
    })
}

/// `+QAUDMOD: <mode>`
fn parse_qaudmod(response: &str) -> Option<i32> {
    let line = response.lines().find(|l| l.contains("+QAUDMOD:"))?;
    line.split(':').nth(1)?.trim().parse().ok()
}

/// `+QPCMV: <enabled>,<mode>`
fn parse_qpcmv(response: &str) -> Option<(bool, i32)> {
    let line = response.lines().find(|l| l.contains("+QPCMV:"))?;
    let data = line.split(':').nth(1)?;
    let parts: Vec<&str> = data.split(',').map(str::trim).collect();
    let enabled = parts.first()?.parse::<i32>().ok()?;
    let mode = parts.get(1).and_then(|s| s.parse::<i32>().ok()).unwrap_or(0);
    Some((enabled == 1, mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_modem, MockAsterisk, MockClock};

    #[test]
    fn test_parse_qcfg_ims() {
        assert_eq!(
            parse_qcfg_ims("+QCFG: \"ims\",1,1\r\nOK"),
            Some((true, true))
        );
        assert_eq!(
            parse_qcfg_ims("+QCFG: \"ims\",1,0\r\nOK"),
            Some((true, false))
        );
        assert_eq!(
            parse_qcfg_ims("+QCFG: \"ims\",0\r\nOK"),
            Some((false, false))
        );
        assert_eq!(parse_qcfg_ims("ERROR"), None);
    }

    #[test]
    fn test_parse_cops_rat() {
        assert_eq!(
            parse_cops_rat("+COPS: 0,0,\"TestTel\",7\r\nOK"),
            Some(NetworkMode::Lte)
        );
        assert_eq!(
            parse_cops_rat("+COPS: 0,0,\"TestTel\",2\r\nOK"),
            Some(NetworkMode::Umts)
        );
        assert_eq!(
            parse_cops_rat("+COPS: 0,0,\"TestTel\",0\r\nOK"),
            Some(NetworkMode::Gsm)
        );
        // Deregistered modems answer with the bare mode field — no RAT there.
        assert_eq!(parse_cops_rat("+COPS: 0\r\nOK"), None);
        assert_eq!(parse_cops_rat("OK"), None);
    }

    #[test]
    fn test_parse_qaudmod_and_qpcmv() {
        assert_eq!(parse_qaudmod("+QAUDMOD: 3\r\nOK"), Some(3));
        assert_eq!(parse_qaudmod("+QAUDMOD: 0\r\nOK"), Some(0));
        assert_eq!(parse_qaudmod("ERROR"), None);
        assert_eq!(parse_qpcmv("+QPCMV: 1,2\r\nOK"), Some((true, 2)));
        assert_eq!(parse_qpcmv("+QPCMV: 0,0\r\nOK"), Some((false, 0)));
    }

    #[test]
    fn test_derive_active_via_lte_voice() {
        let mut s = VolteStatus {
            ims_enabled: Some(true),
            ims_registered: Some(false),
            network_mode: Some(NetworkMode::Lte),
            voice_over_uac: Some(true),
            ..VolteStatus::default()
        };
        s.derive();
        assert!(s.volte_enabled);
        assert!(s.volte_active);
    }

    #[test]
    fn test_derive_active_via_ims_registration() {
        let mut s = VolteStatus {
            ims_enabled: Some(true),
            ims_registered: Some(true),
            network_mode: Some(NetworkMode::Umts),
            ..VolteStatus::default()
        };
        s.derive();
        assert!(s.volte_active);
    }

    #[test]
    fn test_derive_inactive_when_disabled() {
        let mut s = VolteStatus {
            ims_enabled: Some(false),
            ims_registered: Some(true),
            audio_mode: Some(0),
            ..VolteStatus::default()
        };
        s.derive();
        assert!(!s.volte_enabled);
        assert!(!s.volte_active);
    }

    fn controller(
        volte_enabled: bool,
    ) -> (
        VolteController<MockAsterisk, MockClock>,
        Arc<MockAsterisk>,
        Arc<MockClock>,
    ) {
        let asterisk = Arc::new(MockAsterisk::new());
        let clock = Arc::new(MockClock::new(1_000_000));
        let modem = test_modem("modem-1", volte_enabled);
        let vc = VolteController::new(&[modem], Arc::clone(&asterisk), Arc::clone(&clock));
        (vc, asterisk, clock)
    }

    fn script_active_modem(asterisk: &MockAsterisk) {
        asterisk.set_at_response("AT+QCFG=\"ims\"", "+QCFG: \"ims\",1,1\r\nOK");
        asterisk.set_at_response("AT+COPS?", "+COPS: 0,0,\"TestTel\",7\r\nOK");
        asterisk.set_at_response("AT+QAUDMOD?", "+QAUDMOD: 3\r\nOK");
        asterisk.set_at_response("AT+QPCMV?", "+QPCMV: 1,2\r\nOK");
    }

    #[tokio::test]
    async fn test_get_status_caches_within_ttl() {
        let (vc, asterisk, _clock) = controller(true);
        script_active_modem(&asterisk);

        let first = vc.get_status("modem-1", false).await;
        assert!(first.volte_active);
        let queries_after_first = asterisk.at_direct_count();

        let second = vc.get_status("modem-1", false).await;
        assert!(second.volte_active);
        assert_eq!(asterisk.at_direct_count(), queries_after_first);
    }

    #[tokio::test]
    async fn test_get_status_refreshes_after_ttl() {
        let (vc, asterisk, clock) = controller(true);
        script_active_modem(&asterisk);

        vc.get_status("modem-1", false).await;
        let queries = asterisk.at_direct_count();
        clock.advance(STATUS_TTL_MS + 1);
        vc.get_status("modem-1", false).await;
        assert!(asterisk.at_direct_count() > queries);
    }

    #[tokio::test]
    async fn test_toggle_invalidates_cache() {
        let (vc, asterisk, _clock) = controller(true);
        script_active_modem(&asterisk);

        vc.get_status("modem-1", false).await;
        let queries = asterisk.at_direct_count();
        vc.toggle("modem-1", true).await;
        // The toggle re-queried: six sequence commands plus four status reads.
        assert_eq!(asterisk.at_direct_count(), queries + 10);
    }

    #[tokio::test]
    async fn test_unmeaningful_status_is_not_cached() {
        let (vc, asterisk, _clock) = controller(true);
        // All queries error out.
        let first = vc.get_status("modem-1", false).await;
        assert!(!first.meaningful());
        assert!(first.error.is_some());
        let queries = asterisk.at_direct_count();
        vc.get_status("modem-1", false).await;
        assert!(asterisk.at_direct_count() > queries);
    }

    #[tokio::test]
    async fn test_toggle_enable_sends_activation_sequence_in_order() {
        let (vc, asterisk, _clock) = controller(true);
        script_active_modem(&asterisk);

        let result = vc.toggle("modem-1", true).await;
        assert!(result.success);

        // Six sequence commands first, then the four verification queries.
        let sent = asterisk.at_direct_log();
        assert!(sent.len() >= 6);
        for (sent_cmd, expected) in sent.iter().zip(ACTIVATE_SEQUENCE.iter()) {
            assert_eq!(sent_cmd, expected);
        }
    }

    #[tokio::test]
    async fn test_toggle_enable_warns_without_ims_registration() {
        let (vc, asterisk, _clock) = controller(true);
        asterisk.set_at_response("AT+QCFG=\"ims\"", "+QCFG: \"ims\",1,0\r\nOK");
        asterisk.set_at_response("AT+COPS?", "+COPS: 0,0,\"TestTel\",7\r\nOK");
        asterisk.set_at_response("AT+QAUDMOD?", "+QAUDMOD: 3\r\nOK");
        asterisk.set_at_response("AT+QPCMV?", "+QPCMV: 1,2\r\nOK");

        let result = vc.toggle("modem-1", true).await;
        assert!(result.success);
        assert!(result.warning.is_some());
    }

    #[tokio::test]
    async fn test_initialize_waits_for_free_then_activates() {
        let (vc, asterisk, _clock) = controller(true);
        script_active_modem(&asterisk);
        asterisk.push_devices_output("");
        asterisk.push_devices_output("");
        asterisk.push_devices_output("modem-1  /dev/ttyUSB2  Free");

        let result = vc.initialize("modem-1").await;
        assert!(result.success, "error: {:?}", result.error);
        assert!(asterisk.list_devices_count() >= 3);
        let status = result.status.unwrap();
        assert_eq!(status.audio_mode, Some(3));
        assert_eq!(status.pcm_mode, Some(2));
    }

    #[tokio::test]
    async fn test_initialize_skips_activation_when_volte_disabled() {
        let (vc, asterisk, _clock) = controller(false);
        script_active_modem(&asterisk);
        asterisk.push_devices_output("modem-1  /dev/ttyUSB2  Free");

        let result = vc.initialize("modem-1").await;
        assert!(result.success);
        let sent = asterisk.at_direct_log();
        assert!(!sent.iter().any(|c| c == "AT+QAUDMOD=3"));
    }

    #[tokio::test]
    async fn test_initialize_times_out_when_device_never_returns() {
        let (vc, asterisk, _clock) = controller(true);
        asterisk.push_devices_output("");

        let result = vc.initialize("modem-1").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("did not come back"));
    }

    #[test]
    fn test_device_is_free() {
        let table = "ID       Port          State\nmodem-1  /dev/ttyUSB2  Free\nmodem-2  /dev/ttyUSB5  Dialing";
        assert!(device_is_free(table, "modem-1"));
        assert!(!device_is_free(table, "modem-2"));
        assert!(!device_is_free("", "modem-1"));
    }
}
