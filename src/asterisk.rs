//! Telephony engine adapter.
//!
//! [`AsteriskControl`] is the seam between the supervisor and the outside
//! world: engine CLI commands, direct serial AT, driver module lifecycle,
//! service restart, host reboot. Production uses [`AsteriskCli`], which
//! shells out to `asterisk -rx`; tests script the trait with canned
//! transcripts so the whole state machine runs without hardware.
//!
//! Every operation returns a plain `String` and encodes failure as text
//! (`Error`, `Unable`, `No such device`) — the legacy contract the engine's
//! own CLI established, which every consumer pattern-matches.

use std::future::Future;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::clock::{rfc3339_ms, Clock, SystemClock};
use crate::config::AsteriskConfig;
use crate::{serial, shell};

/// External effects the supervisor can trigger.
pub trait AsteriskControl: Send + Sync + 'static {
    /// Run one engine CLI command (`asterisk -rx "<command>"`), stderr folded in.
    fn cli(&self, command: &str) -> impl Future<Output = String> + Send;

    /// Queue an AT command through the channel driver (`quectel cmd <id> <at>`).
    fn send_at(&self, modem_id: &str, at: &str) -> impl Future<Output = String> + Send;

    /// Send an AT command straight to a serial device, bypassing the engine.
    fn send_at_direct(
        &self,
        port: &str,
        at: &str,
        timeout_secs: u64,
    ) -> impl Future<Output = String> + Send;

    /// Raw table of devices registered with the channel driver.
    fn list_devices(&self) -> impl Future<Output = String> + Send;

    fn module_reload(&self) -> impl Future<Output = String> + Send;

    fn module_unload(&self) -> impl Future<Output = String> + Send;

    fn module_load(&self) -> impl Future<Output = String> + Send;

    /// Restart the engine's systemd unit.
    fn restart_service(&self) -> impl Future<Output = String> + Send;

    /// Record `reason` in the reboot log, then schedule an immediate host
    /// reboot.
    fn reboot_host(&self, reason: &str) -> impl Future<Output = String> + Send;
}

/// The engine's textual failure modes.
#[must_use]
pub fn is_cli_error(output: &str) -> bool {
    output.contains("Error") || output.contains("Unable") || output.contains("No such device")
}

/// Production adapter shelling out to the engine CLI and systemctl.
pub struct AsteriskCli {
    cli_bin: String,
    service: String,
    channel_module: String,
    cli_timeout_ms: u64,
    reboot_log: PathBuf,
}

impl AsteriskCli {
    #[must_use]
    pub fn new(config: &AsteriskConfig) -> Self {
        Self {
            cli_bin: config.cli.clone(),
            service: config.service.clone(),
            channel_module: config.channel_module.clone(),
            cli_timeout_ms: config.cli_timeout_ms,
            reboot_log: PathBuf::from(&config.reboot_log),
        }
    }

    fn cli_command(&self, command: &str) -> String {
        format!("{} -rx \"{}\"", self.cli_bin, command.replace('"', "\\\""))
    }

    fn run_cli(&self, command: &str) -> impl Future<Output = String> + Send {
        let shell_cmd = self.cli_command(command);
        let timeout = self.cli_timeout_ms;
        async move { shell::run(&shell_cmd, timeout).await.text() }
    }
}

impl AsteriskControl for AsteriskCli {
    fn cli(&self, command: &str) -> impl Future<Output = String> + Send {
        self.run_cli(command)
    }

    fn send_at(&self, modem_id: &str, at: &str) -> impl Future<Output = String> + Send {
        self.run_cli(&format!("quectel cmd {modem_id} {at}"))
    }

    fn send_at_direct(
        &self,
        port: &str,
        at: &str,
        timeout_secs: u64,
    ) -> impl Future<Output = String> + Send {
        let port = port.to_string();
        let at = at.to_string();
        async move { serial::send_at_direct(&port, &at, timeout_secs).await }
    }

    fn list_devices(&self) -> impl Future<Output = String> + Send {
        self.run_cli("quectel show devices")
    }

    fn module_reload(&self) -> impl Future<Output = String> + Send {
        self.run_cli(&format!("module reload {}", self.channel_module))
    }

    fn module_unload(&self) -> impl Future<Output = String> + Send {
        self.run_cli(&format!("module unload {}", self.channel_module))
    }

    fn module_load(&self) -> impl Future<Output = String> + Send {
        self.run_cli(&format!("module load {}", self.channel_module))
    }

    fn restart_service(&self) -> impl Future<Output = String> + Send {
        let cmd = format!("systemctl restart {}", self.service);
        async move { shell::run(&cmd, 60_000).await.text() }
    }

    fn reboot_host(&self, reason: &str) -> impl Future<Output = String> + Send {
        let log_path = self.reboot_log.clone();
        let line = format!("[{}] {}\n", rfc3339_ms(SystemClock.now_ms()), reason);
        async move {
            info!("Host reboot requested: {}", line.trim());
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        error!("Failed to record reboot reason: {e}");
                    }
                }
                Err(e) => error!("Failed to open {}: {e}", log_path.display()),
            }
            shell::run("shutdown -r now", 10_000).await.text()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AsteriskConfig;

    #[test]
    fn test_cli_command_escapes_quotes() {
        let cli = AsteriskCli::new(&AsteriskConfig::default());
        assert_eq!(
            cli.cli_command("quectel cmd modem-1 AT+QCFG=\"ims\",1"),
            "asterisk -rx \"quectel cmd modem-1 AT+QCFG=\\\"ims\\\",1\""
        );
    }

    #[test]
    fn test_is_cli_error_matches_engine_failures() {
        assert!(is_cli_error("Error: No such command"));
        assert!(is_cli_error("Unable to connect to remote asterisk"));
        assert!(is_cli_error("No such device 'modem-9'"));
        assert!(!is_cli_error("Device state: Free"));
    }
}
