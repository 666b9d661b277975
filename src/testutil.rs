//! Scripted test doubles for the external world.
//!
//! `MockAsterisk` answers CLI and serial traffic from canned transcripts and
//! records everything it was asked to do; `MockClock` advances instantly on
//! every sleep so escalation scenarios run without real time passing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::asterisk::AsteriskControl;
use crate::clock::Clock;
use crate::config::{Config, ModemConfig, ModemType};

pub fn test_modem(id: &str, volte_enabled: bool) -> ModemConfig {
    ModemConfig {
        id: id.to_string(),
        modem_type: ModemType::Ec25,
        data_port: "/dev/ttyUSB2".to_string(),
        volte_enabled,
        imsi: None,
        phone_number: None,
    }
}

pub fn test_config(modems: Vec<ModemConfig>) -> Config {
    let mut config: Config = toml::from_str("").expect("defaults deserialize");
    config.modems = modems;
    config
}

#[derive(Default)]
pub struct MockAsterisk {
    device_state: Mutex<HashMap<String, String>>,
    devices_outputs: Mutex<VecDeque<String>>,
    cli_responses: Mutex<HashMap<String, String>>,
    at_responses: Mutex<HashMap<String, String>>,
    cli_log: Mutex<Vec<String>>,
    at_log: Mutex<Vec<String>>,
    at_direct: Mutex<Vec<String>>,
    list_calls: AtomicU64,
}

impl MockAsterisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canned output for `quectel show device state <id>`.
    pub fn set_device_state(&self, modem_id: &str, output: &str) {
        self.device_state
            .lock()
            .unwrap()
            .insert(modem_id.to_string(), output.to_string());
    }

    /// Canned response for a direct-serial (or engine-queued) AT command.
    pub fn set_at_response(&self, command: &str, response: &str) {
        self.at_responses
            .lock()
            .unwrap()
            .insert(command.to_string(), response.to_string());
    }

    /// Canned response for any CLI command starting with `prefix`.
    pub fn set_cli_response(&self, prefix: &str, response: &str) {
        self.cli_responses
            .lock()
            .unwrap()
            .insert(prefix.to_string(), response.to_string());
    }

    /// Queue one `list_devices` output; the last queued value repeats.
    pub fn push_devices_output(&self, output: &str) {
        self.devices_outputs
            .lock()
            .unwrap()
            .push_back(output.to_string());
    }

    pub fn cli_log(&self) -> Vec<String> {
        self.cli_log.lock().unwrap().clone()
    }

    pub fn at_direct_log(&self) -> Vec<String> {
        self.at_direct.lock().unwrap().clone()
    }

    pub fn at_direct_count(&self) -> usize {
        self.at_direct.lock().unwrap().len()
    }

    pub fn list_devices_count(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn handle_cli(&self, command: &str) -> String {
        self.cli_log.lock().unwrap().push(command.to_string());
        if let Some(id) = command.strip_prefix("quectel show device state ") {
            return self
                .device_state
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("No such device '{id}'"));
        }
        let responses = self.cli_responses.lock().unwrap();
        for (prefix, response) in responses.iter() {
            if command.starts_with(prefix.as_str()) {
                return response.clone();
            }
        }
        String::new()
    }
}

impl AsteriskControl for MockAsterisk {
    fn cli(&self, command: &str) -> impl Future<Output = String> + Send {
        std::future::ready(self.handle_cli(command))
    }

    fn send_at(&self, modem_id: &str, at: &str) -> impl Future<Output = String> + Send {
        self.at_log
            .lock()
            .unwrap()
            .push(format!("{modem_id} {at}"));
        let response = self
            .at_responses
            .lock()
            .unwrap()
            .get(at)
            .cloned()
            .unwrap_or_else(|| "OK".to_string());
        std::future::ready(response)
    }

    fn send_at_direct(
        &self,
        _port: &str,
        at: &str,
        _timeout_secs: u64,
    ) -> impl Future<Output = String> + Send {
        self.at_direct.lock().unwrap().push(at.to_string());
        let response = self
            .at_responses
            .lock()
            .unwrap()
            .get(at)
            .cloned()
            .unwrap_or_else(|| "Error: no response within 3s".to_string());
        std::future::ready(response)
    }

    fn list_devices(&self) -> impl Future<Output = String> + Send {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut outputs = self.devices_outputs.lock().unwrap();
        let response = if outputs.len() > 1 {
            outputs.pop_front().unwrap_or_default()
        } else {
            outputs.front().cloned().unwrap_or_default()
        };
        std::future::ready(response)
    }

    fn module_reload(&self) -> impl Future<Output = String> + Send {
        std::future::ready(self.handle_cli("module reload chan_quectel"))
    }

    fn module_unload(&self) -> impl Future<Output = String> + Send {
        std::future::ready(self.handle_cli("module unload chan_quectel"))
    }

    fn module_load(&self) -> impl Future<Output = String> + Send {
        std::future::ready(self.handle_cli("module load chan_quectel"))
    }

    fn restart_service(&self) -> impl Future<Output = String> + Send {
        std::future::ready(self.handle_cli("systemctl restart asterisk"))
    }

    fn reboot_host(&self, reason: &str) -> impl Future<Output = String> + Send {
        std::future::ready(self.handle_cli(&format!("reboot_host {reason}")))
    }
}

/// Manual clock: `sleep_ms` advances time instantly instead of waiting.
pub struct MockClock {
    now: AtomicU64,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) -> impl Future<Output = ()> + Send {
        // Advance instantly, but still yield so a spawned ticker cannot
        // starve the test scheduler.
        self.now.fetch_add(ms, Ordering::SeqCst);
        tokio::task::yield_now()
    }
}
