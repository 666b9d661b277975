//! Modem health supervision with progressive recovery.
//!
//! A periodic task checks every configured modem through the engine CLI,
//! classifies problems from the observed status, and applies corrective
//! actions ordered from least to most disruptive: diagnostic AT commands,
//! modem reset, channel-driver reload, engine restart, host reboot. Every
//! level has a cooldown and an attempt budget; once a level's budget is
//! spent the next dispatch escalates. A healthy check at any point resets
//! the whole escalation.
//!
//! Disruptive recoveries (reset and above) are followed by VoLTE
//! reinitialization, because the modem's audio-path registers do not
//! survive re-enumeration.
//!
//! External effects go through [`AsteriskControl`] and time through
//! [`Clock`], so the entire state machine runs under test with scripted
//! transcripts and a manual clock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actionlog::{ActionEntry, ActionLog, LogStats};
use crate::asterisk::{is_cli_error, AsteriskCli, AsteriskControl};
use crate::clock::{rfc3339_ms, Clock, SystemClock};
use crate::config::{Config, ModemConfig, WatchdogConfig, WatchdogUpdate};
use crate::status::{parse_device_state, ModemStatus};
use crate::volte::VolteController;

/// Delay before the first health check after `start()`, giving the engine
/// time to register its devices after a cold boot.
const WARMUP_MS: u64 = 30_000;
/// How many files an SMS spool cleanup keeps.
const SMSDB_KEEP: usize = 100;
/// Warning window before a MAXIMUM-level host reboot.
const REBOOT_COUNTDOWN_SECS: u64 = 10;

/// Escalation levels, least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    None,
    Soft,
    Medium,
    Hard,
    Critical,
    Maximum,
}

impl Level {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Level::None => "NONE",
            Level::Soft => "SOFT",
            Level::Medium => "MEDIUM",
            Level::Hard => "HARD",
            Level::Critical => "CRITICAL",
            Level::Maximum => "MAXIMUM",
        }
    }

    #[must_use]
    pub fn index(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Level::None),
            1 => Some(Level::Soft),
            2 => Some(Level::Medium),
            3 => Some(Level::Hard),
            4 => Some(Level::Critical),
            5 => Some(Level::Maximum),
            _ => None,
        }
    }

    /// The next level up, saturating at MAXIMUM.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Level::None => Level::Soft,
            Level::Soft => Level::Medium,
            Level::Medium => Level::Hard,
            Level::Hard => Level::Critical,
            Level::Critical | Level::Maximum => Level::Maximum,
        }
    }
}

/// What is wrong with a modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemKind {
    NotFound,
    NotInit,
    NoSignal,
    WeakSignal,
    NotRegistered,
    NoProvider,
    VolteInactive,
    Manual,
}

impl ProblemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProblemKind::NotFound => "NOT_FOUND",
            ProblemKind::NotInit => "NOT_INIT",
            ProblemKind::NoSignal => "NO_SIGNAL",
            ProblemKind::WeakSignal => "WEAK_SIGNAL",
            ProblemKind::NotRegistered => "NOT_REGISTERED",
            ProblemKind::NoProvider => "NO_PROVIDER",
            ProblemKind::VolteInactive => "VOLTE_INACTIVE",
            ProblemKind::Manual => "MANUAL",
        }
    }

    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            ProblemKind::NotFound | ProblemKind::NotInit | ProblemKind::Manual => Severity::High,
            ProblemKind::NoSignal | ProblemKind::NotRegistered | ProblemKind::NoProvider => {
                Severity::Medium
            }
            ProblemKind::WeakSignal | ProblemKind::VolteInactive => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: ProblemKind,
    pub message: String,
    pub severity: Severity,
}

impl Problem {
    fn new(kind: ProblemKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: kind.severity(),
        }
    }
}

/// Mutable per-modem supervision state, owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ModemState {
    pub current_level: Level,
    pub consecutive_failures: u32,
    pub attempts_at_level: u32,
    /// Last dispatch time per level, for cooldown arithmetic.
    pub last_action_ms: HashMap<Level, u64>,
    pub last_healthy_ms: u64,
    pub problem_start_ms: Option<u64>,
    pub problem_kind: Option<ProblemKind>,
    pub last_status: Option<ModemStatus>,
}

impl ModemState {
    fn new(now_ms: u64) -> Self {
        Self {
            current_level: Level::None,
            consecutive_failures: 0,
            attempts_at_level: 0,
            last_action_ms: HashMap::new(),
            last_healthy_ms: now_ms,
            problem_start_ms: None,
            problem_kind: None,
            last_status: None,
        }
    }
}

/// Outcome of one dispatched action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

/// SMS spool cleanup report.
#[derive(Debug, Clone, Serialize)]
pub struct SmsdbCleanup {
    pub cleaned: bool,
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
}

/// Production supervisor type as wired in `main`.
pub type Supervisor = HealthSupervisor<AsteriskCli, SystemClock>;

pub struct HealthSupervisor<A: AsteriskControl, C: Clock> {
    config: RwLock<WatchdogConfig>,
    modems: Vec<ModemConfig>,
    smsdb_dir: PathBuf,
    asterisk: Arc<A>,
    volte: Arc<VolteController<A, C>>,
    clock: Arc<C>,
    log: Arc<ActionLog>,
    states: Mutex<HashMap<String, ModemState>>,
    events: broadcast::Sender<Value>,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every `start()`; a ticker from a previous generation exits
    /// even if the supervisor was restarted while it slept.
    epoch: AtomicU64,
    /// Wakes the ticker out of its sleep on stop/reconfigure.
    wake: Notify,
}

impl<A: AsteriskControl, C: Clock> HealthSupervisor<A, C> {
    pub fn new(
        config: &Config,
        asterisk: Arc<A>,
        volte: Arc<VolteController<A, C>>,
        clock: Arc<C>,
        log: Arc<ActionLog>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config: RwLock::new(config.watchdog.clone()),
            modems: config.modems.clone(),
            smsdb_dir: PathBuf::from(&config.asterisk.smsdb_dir),
            asterisk,
            volte,
            clock,
            log,
            states: Mutex::new(HashMap::new()),
            events,
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
            epoch: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    /// Subscribe to lifecycle and action events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: Value) {
        let _ = self.events.send(event);
    }

    /// Start the periodic checker. Idempotent: a second call while running
    /// is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("watchdog already running");
            return;
        }
        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Self::spawn_ticker(Arc::clone(self), WARMUP_MS, generation);
        *self.ticker.lock().await = Some(handle);
        info!("Watchdog started ({} modems)", self.modems.len());
        self.emit(json!({"type": "started"}));
    }

    /// Stop the periodic checker. Idempotent. An in-flight health check
    /// finishes on its own; only future ticks are prevented.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake.notify_one();
        self.ticker.lock().await.take();
        info!("Watchdog stopped");
        self.emit(json!({"type": "stopped"}));
    }

    /// Merge a partial config update. When the interval changed while
    /// running, the sleeping ticker is woken so the new period applies
    /// immediately.
    pub async fn reconfigure(&self, update: &WatchdogUpdate) -> WatchdogConfig {
        let interval_changed = self.config.write().await.apply(update);
        if interval_changed && self.is_running() {
            self.wake.notify_one();
        }
        self.config.read().await.clone()
    }

    #[must_use]
    pub async fn config_snapshot(&self) -> WatchdogConfig {
        self.config.read().await.clone()
    }

    fn spawn_ticker(sup: Arc<Self>, warmup_ms: u64, generation: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            if warmup_ms > 0 {
                tokio::select! {
                    () = sup.clock.sleep_ms(warmup_ms) => {}
                    () = sup.wake.notified() => {}
                }
            }
            loop {
                if !sup.running.load(Ordering::SeqCst)
                    || sup.epoch.load(Ordering::SeqCst) != generation
                {
                    break;
                }
                sup.run_health_check().await;
                let interval = sup.config.read().await.check_interval_ms;
                tokio::select! {
                    () = sup.clock.sleep_ms(interval) => {}
                    () = sup.wake.notified() => {}
                }
            }
            debug!("watchdog ticker exiting");
        })
    }

    /// One full pass over the fleet. Modems are checked strictly in
    /// sequence; per-modem state never sees concurrent mutation.
    pub async fn run_health_check(&self) {
        for modem in &self.modems {
            self.check_modem(modem).await;
        }
    }

    async fn fetch_status(&self, modem: &ModemConfig) -> ModemStatus {
        let output = self
            .asterisk
            .cli(&format!("quectel show device state {}", modem.id))
            .await;
        let mut status = parse_device_state(&output);
        status.volte_enabled = modem.volte_enabled;
        if modem.volte_enabled && status.state == "Free" {
            let volte = self.volte.get_status(&modem.id, false).await;
            // A serial hiccup must not look like a VoLTE outage.
            status.volte_active = if volte.meaningful() {
                volte.volte_active
            } else {
                true
            };
        }
        status
    }

    async fn check_modem(&self, modem: &ModemConfig) {
        let now = self.clock.now_ms();
        let status = self.fetch_status(modem).await;
        let cfg = self.config.read().await.clone();

        let mut pending_recovery: Option<ActionEntry> = None;
        let mut pending_dispatch: Option<(Level, Problem)> = None;

        {
            let mut states = self.states.lock().await;
            let state = states
                .entry(modem.id.clone())
                .or_insert_with(|| ModemState::new(now));
            state.last_status = Some(status.clone());

            // A failed status fetch that is not a definite NOT_FOUND counts
            // as a missed check, never as a recovery.
            if status.error.is_some() && !status.is_not_found() {
                state.consecutive_failures += 1;
                warn!(
                    "{}: status fetch failed ({}), {} consecutive",
                    modem.id,
                    status.error.as_deref().unwrap_or(""),
                    state.consecutive_failures
                );
                return;
            }

            match detect_problem(modem, &status, &cfg) {
                None => {
                    if state.current_level != Level::None {
                        let duration_secs =
                            now.saturating_sub(state.problem_start_ms.unwrap_or(now)) / 1000;
                        info!(
                            "{}: recovered from {} after {}s (was at {})",
                            modem.id,
                            state.problem_kind.map_or("?", ProblemKind::as_str),
                            duration_secs,
                            state.current_level.name()
                        );
                        pending_recovery = Some(ActionEntry {
                            timestamp: rfc3339_ms(now),
                            modem_id: modem.id.clone(),
                            level: Level::None.index(),
                            level_name: "RECOVERY".to_string(),
                            problem_type: state
                                .problem_kind
                                .map_or_else(|| "UNKNOWN".to_string(), |k| k.as_str().to_string()),
                            problem_message: "Modem healthy again".to_string(),
                            action_success: true,
                            action_message: format!("recovered after {duration_secs}s"),
                            previous_level: Some(state.current_level.index()),
                            problem_duration_secs: Some(duration_secs),
                        });
                    }
                    state.consecutive_failures = 0;
                    state.current_level = Level::None;
                    state.attempts_at_level = 0;
                    state.problem_start_ms = None;
                    state.problem_kind = None;
                    state.last_healthy_ms = now;
                }
                Some(problem) => {
                    state.consecutive_failures += 1;
                    if state.problem_start_ms.is_none() {
                        state.problem_start_ms = Some(now);
                        state.problem_kind = Some(problem.kind);
                    }
                    debug!(
                        "{}: {} ({}), {} consecutive",
                        modem.id,
                        problem.kind.as_str(),
                        problem.message,
                        state.consecutive_failures
                    );
                    if state.consecutive_failures >= cfg.thresholds.max_consecutive_failures
                        && persistence_met(problem.kind, state.problem_start_ms, now, &cfg)
                    {
                        if let Some(target) = decide_level(state, &cfg, now) {
                            // Commit before acting so the attempt budget
                            // holds even when the action itself fails.
                            if target == state.current_level {
                                state.attempts_at_level += 1;
                            } else {
                                state.attempts_at_level = 1;
                            }
                            state.current_level = target;
                            state.last_action_ms.insert(target, now);
                            pending_dispatch = Some((target, problem));
                        }
                    }
                }
            }
        }

        if let Some(entry) = pending_recovery {
            self.log.write(&entry).await;
        }
        if let Some((level, problem)) = pending_dispatch {
            let outcome = self.dispatch(modem, level, &problem).await;
            self.record_action(modem, level, &problem, &outcome, now).await;
        }
    }

    async fn dispatch(&self, modem: &ModemConfig, level: Level, problem: &Problem) -> ActionOutcome {
        info!(
            "{}: dispatching {} for {}",
            modem.id,
            level.name(),
            problem.kind.as_str()
        );
        let outcome = match level {
            Level::None => ActionOutcome {
                success: false,
                message: "nothing to dispatch at NONE".to_string(),
            },
            Level::Soft => self.action_soft(modem, problem).await,
            Level::Medium => self.action_medium(modem).await,
            Level::Hard => self.action_hard(modem).await,
            Level::Critical => self.action_critical(modem).await,
            Level::Maximum => self.action_maximum(modem, problem).await,
        };

        // Anything that re-enumerated the modem wiped its audio-path
        // registers; re-apply them before the next check.
        if modem.volte_enabled
            && matches!(level, Level::Medium | Level::Hard | Level::Critical)
        {
            let reinit = self.volte.initialize(&modem.id).await;
            if !reinit.success {
                warn!(
                    "{}: VoLTE reinitialization failed: {}",
                    modem.id,
                    reinit.error.as_deref().unwrap_or("unknown")
                );
            }
        }
        outcome
    }

    /// SOFT: diagnostic AT sweep, plus VoLTE reactivation when that is the
    /// diagnosed problem.
    async fn action_soft(&self, modem: &ModemConfig, problem: &Problem) -> ActionOutcome {
        let mut notes = Vec::new();
        for at in ["AT+CREG?", "AT+CSQ", "AT+COPS?"] {
            let response = self.asterisk.send_at(&modem.id, at).await;
            notes.push(format!("{at}: {}", condense(&response)));
        }

        if problem.kind == ProblemKind::VolteInactive {
            let result = self.volte.toggle(&modem.id, true).await;
            notes.push(if result.success {
                "VoLTE reactivated".to_string()
            } else {
                format!(
                    "VoLTE reactivation failed: {}",
                    result.error.as_deref().unwrap_or("unknown")
                )
            });
            return ActionOutcome {
                success: result.success,
                message: notes.join("; "),
            };
        }

        ActionOutcome {
            success: true,
            message: format!("diagnostics: {}", notes.join("; ")),
        }
    }

    /// MEDIUM: ask the channel driver to power-cycle the modem.
    async fn action_medium(&self, modem: &ModemConfig) -> ActionOutcome {
        let output = self
            .asterisk
            .cli(&format!("quectel reset {}", modem.id))
            .await;
        self.clock.sleep_ms(10_000).await;
        ActionOutcome {
            success: !is_cli_error(&output),
            message: format!("quectel reset: {}", condense(&output)),
        }
    }

    /// HARD: reload the channel driver, falling back to unload/load when the
    /// reload itself fails.
    async fn action_hard(&self, _modem: &ModemConfig) -> ActionOutcome {
        let mut output = self.asterisk.module_reload().await;
        if is_cli_error(&output) {
            warn!(
                "module reload failed ({}), falling back to unload/load",
                condense(&output)
            );
            self.asterisk.module_unload().await;
            self.clock.sleep_ms(2_000).await;
            output = self.asterisk.module_load().await;
        }
        self.clock.sleep_ms(15_000).await;
        ActionOutcome {
            success: !is_cli_error(&output),
            message: format!("module reload: {}", condense(&output)),
        }
    }

    /// CRITICAL: restart the whole engine.
    async fn action_critical(&self, _modem: &ModemConfig) -> ActionOutcome {
        let output = self.asterisk.restart_service().await;
        self.clock.sleep_ms(30_000).await;
        ActionOutcome {
            success: !output.starts_with("Error"),
            message: format!("service restart: {}", condense(&output)),
        }
    }

    /// MAXIMUM: reboot the host after a warning window.
    async fn action_maximum(&self, modem: &ModemConfig, problem: &Problem) -> ActionOutcome {
        let reason = format!(
            "{}: {} unrecovered after CRITICAL, rebooting host",
            modem.id,
            problem.kind.as_str()
        );
        error!("{reason} (in {REBOOT_COUNTDOWN_SECS}s)");
        self.emit(json!({
            "type": "reboot_imminent",
            "reason": reason,
            "countdown": REBOOT_COUNTDOWN_SECS,
        }));
        self.clock.sleep_ms(REBOOT_COUNTDOWN_SECS * 1000).await;
        let output = self.asterisk.reboot_host(&reason).await;
        ActionOutcome {
            success: !output.starts_with("Error"),
            message: format!("host reboot: {}", condense(&output)),
        }
    }

    async fn record_action(
        &self,
        modem: &ModemConfig,
        level: Level,
        problem: &Problem,
        outcome: &ActionOutcome,
        now: u64,
    ) {
        let entry = ActionEntry {
            timestamp: rfc3339_ms(now),
            modem_id: modem.id.clone(),
            level: level.index(),
            level_name: level.name().to_string(),
            problem_type: problem.kind.as_str().to_string(),
            problem_message: problem.message.clone(),
            action_success: outcome.success,
            action_message: outcome.message.clone(),
            previous_level: None,
            problem_duration_secs: None,
        };
        self.log.write(&entry).await;
        self.emit(json!({
            "type": "action",
            "modem_id": modem.id,
            "level": level.index(),
            "level_name": level.name(),
            "problem": problem,
            "action": outcome,
            "timestamp": entry.timestamp,
        }));
    }

    /// Dispatch `level` immediately with a synthesized MANUAL problem,
    /// bypassing cooldowns and attempt budgets. Escalation state is left
    /// untouched — a forced action is an operator probe, not a step in the
    /// automatic ladder.
    pub async fn force_action(
        &self,
        modem_id: &str,
        level_index: u8,
    ) -> Result<ActionOutcome, String> {
        let level = match Level::from_index(level_index) {
            Some(l) if l != Level::None => l,
            _ => return Err(format!("level must be 1..=5, got {level_index}")),
        };
        let Some(modem) = self.modems.iter().find(|m| m.id == modem_id).cloned() else {
            return Err(format!("unknown modem '{modem_id}'"));
        };

        let problem = Problem::new(
            ProblemKind::Manual,
            format!("manually requested {} action", level.name()),
        );
        let now = self.clock.now_ms();
        info!("{modem_id}: forced {} action", level.name());
        let outcome = self.dispatch(&modem, level, &problem).await;
        self.record_action(&modem, level, &problem, &outcome, now).await;
        Ok(outcome)
    }

    /// Zero the escalation and problem tracking for one modem, keeping the
    /// last observed status and the per-level cooldown stamps.
    pub async fn reset_escalation(&self, modem_id: &str) -> bool {
        if !self.modems.iter().any(|m| m.id == modem_id) {
            return false;
        }
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(modem_id) {
            state.current_level = Level::None;
            state.consecutive_failures = 0;
            state.attempts_at_level = 0;
            state.problem_start_ms = None;
            state.problem_kind = None;
            info!("{modem_id}: escalation state reset");
        }
        true
    }

    /// Count the engine's SMS spool; past the configured limit, keep only
    /// the newest [`SMSDB_KEEP`] files.
    pub async fn cleanup_smsdb(&self) -> SmsdbCleanup {
        let max = self.config.read().await.thresholds.smsdb_max_messages;

        let mut dir = match tokio::fs::read_dir(&self.smsdb_dir).await {
            Ok(d) => d,
            Err(e) => {
                warn!("SMS spool {} unreadable: {e}", self.smsdb_dir.display());
                return SmsdbCleanup {
                    cleaned: false,
                    removed: 0,
                    file_count: None,
                };
            }
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_file() {
                files.push((entry.path(), meta.modified().unwrap_or(UNIX_EPOCH)));
            }
        }

        let file_count = files.len();
        if file_count <= max {
            return SmsdbCleanup {
                cleaned: false,
                removed: 0,
                file_count: Some(file_count),
            };
        }

        files.sort_by(|a, b| b.1.cmp(&a.1));
        let mut removed = 0;
        for (path, _) in files.into_iter().skip(SMSDB_KEEP) {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        info!("SMS spool cleanup: removed {removed} of {file_count} files");
        SmsdbCleanup {
            cleaned: true,
            removed,
            file_count: Some(file_count),
        }
    }

    /// Full status snapshot for the control API.
    pub async fn status_snapshot(&self) -> Value {
        let cfg = self.config.read().await.clone();
        let now = self.clock.now_ms();
        let states = self.states.lock().await;

        let modems: serde_json::Map<String, Value> = self
            .modems
            .iter()
            .map(|m| {
                let value = states.get(&m.id).map_or_else(
                    || json!({"level": 0, "level_name": "NONE", "checked": false}),
                    |s| {
                        json!({
                            "level": s.current_level.index(),
                            "level_name": s.current_level.name(),
                            "consecutive_failures": s.consecutive_failures,
                            "attempts_at_level": s.attempts_at_level,
                            "problem_type": s.problem_kind.map(ProblemKind::as_str),
                            "problem_for_secs": s.problem_start_ms
                                .map(|t| now.saturating_sub(t) / 1000),
                            "last_healthy": rfc3339_ms(s.last_healthy_ms),
                            "state": s.last_status.as_ref().map(|st| st.state.clone()),
                            "rssi": s.last_status.as_ref().map(|st| st.rssi),
                        })
                    },
                );
                (m.id.clone(), value)
            })
            .collect();
        drop(states);

        json!({
            "running": self.is_running(),
            "enabled": cfg.enabled,
            "check_interval_ms": cfg.check_interval_ms,
            "thresholds": cfg.thresholds,
            "enabled_levels": cfg.enabled_levels,
            "modems": modems,
            "recent_actions": self.log.recent(20).await,
            "log": self.log.stats().await,
        })
    }

    /// In-memory action ring, most recent first.
    pub async fn history(&self, limit: usize) -> Vec<ActionEntry> {
        self.log.recent(limit).await
    }

    /// Durable log tail, most recent first.
    pub async fn log_history(&self, limit: usize) -> Vec<Value> {
        self.log.read_recent(limit).await
    }

    pub async fn log_stats(&self) -> LogStats {
        self.log.stats().await
    }

    pub async fn clear_logs(&self) {
        self.log.clear().await;
        info!("Action log cleared");
    }

    /// Copy of one modem's supervision state, for tests and debugging.
    pub async fn modem_state(&self, modem_id: &str) -> Option<ModemState> {
        self.states.lock().await.get(modem_id).cloned()
    }
}

/// Classify the observed status, strict first-match order. Persistence
/// gates are deliberately *not* applied here — a raw sighting must count
/// toward `consecutive_failures` and stamp `problem_start_ms`, otherwise
/// time-gated problems could never accumulate the persistence they gate on.
#[must_use]
pub fn detect_problem(
    modem: &ModemConfig,
    status: &ModemStatus,
    cfg: &WatchdogConfig,
) -> Option<Problem> {
    if status.is_not_found() {
        return Some(Problem::new(
            ProblemKind::NotFound,
            format!("{} is not registered with the engine", modem.id),
        ));
    }
    if status.state.to_lowercase().contains("not init") {
        return Some(Problem::new(
            ProblemKind::NotInit,
            format!("{} is stuck in '{}'", modem.id, status.state),
        ));
    }
    if status.rssi == 0 {
        return Some(Problem::new(ProblemKind::NoSignal, "no signal (RSSI 0)"));
    }
    if status.rssi < cfg.thresholds.min_rssi {
        return Some(Problem::new(
            ProblemKind::WeakSignal,
            format!(
                "weak signal (RSSI {} below {})",
                status.rssi, cfg.thresholds.min_rssi
            ),
        ));
    }
    if status.state == "Free" {
        if !status.registered {
            return Some(Problem::new(
                ProblemKind::NotRegistered,
                "not registered on the network",
            ));
        }
        if status.provider.is_none() {
            return Some(Problem::new(ProblemKind::NoProvider, "no provider name"));
        }
        if status.volte_enabled && !status.volte_active {
            return Some(Problem::new(
                ProblemKind::VolteInactive,
                "VoLTE configured but not active",
            ));
        }
    }
    None
}

/// Whether a problem has persisted long enough for its kind's gate.
/// The gate opens at exactly the configured threshold.
fn persistence_met(
    kind: ProblemKind,
    problem_start_ms: Option<u64>,
    now: u64,
    cfg: &WatchdogConfig,
) -> bool {
    let minutes = match kind {
        ProblemKind::NotInit => cfg.thresholds.max_not_init_minutes,
        ProblemKind::NoSignal => cfg.thresholds.max_no_signal_minutes,
        ProblemKind::NotRegistered | ProblemKind::NoProvider => {
            cfg.thresholds.max_no_provider_minutes
        }
        _ => return true,
    };
    let start = problem_start_ms.unwrap_or(now);
    now.saturating_sub(start) >= minutes * 60_000
}

/// The escalation decision. Returns the level to dispatch, or `None` when
/// the target is disabled or still cooling down. Deliberately mutation-free:
/// a skipped dispatch leaves the state untouched, so the next tick makes the
/// same decision again.
///
/// TODO: when the target level is disabled, consider advancing past it
/// instead of retrying the same disabled escalation every tick.
fn decide_level(state: &ModemState, cfg: &WatchdogConfig, now: u64) -> Option<Level> {
    let mut target = state.current_level;
    if state.attempts_at_level >= cfg.max_attempts(target) {
        target = target.next();
    }
    if target == Level::None {
        target = Level::Soft;
    }
    if !cfg.level_enabled(target) {
        debug!("level {} disabled, skipping dispatch", target.name());
        return None;
    }
    if let Some(&last) = state.last_action_ms.get(&target) {
        if now.saturating_sub(last) < cfg.cooldown_ms(target) {
            return None;
        }
    }
    Some(target)
}

/// Collapse whitespace and cap the length for one-line log messages.
fn condense(s: &str) -> String {
    let cleaned: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= 120 {
        cleaned
    } else {
        let mut out: String = cleaned.chars().take(117).collect();
        out.push_str("...");
        out
    }
}
