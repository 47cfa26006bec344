use std::{sync::Arc, time::Duration};

use beacon_lifecycle::{CloudState, InstanceInfo, ObservedStats, ServerState, StatusReport};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use crate::adapters::{Clock, Remotes};
use crate::config::ServerConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::idle::IdleTracker;
use crate::notify::{Destination, Notice};
use crate::status::StatusReporter;

pub const PHASE_BOOTING: &str = "1/4 booting cloud instance";
pub const PHASE_PREPARING: &str = "2/4 preparing cloud instance";
pub const PHASE_LAUNCHING: &str = "3/4 launching game server";
pub const PHASE_MAINTENANCE: &str = "restarting for maintenance";

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub instance_id: String,
    pub run_command: String,
    pub ready_sentinel: String,
    pub launch_timeout: Duration,
    pub query_port: u16,
    pub rcon_port: u16,
    pub rcon_password: String,
    pub console_stop_grace: Duration,
    pub idle_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            instance_id: cfg.instance_id.clone(),
            run_command: cfg.run_command.clone(),
            ready_sentinel: cfg.ready_sentinel.clone(),
            launch_timeout: cfg.launch_timeout(),
            query_port: cfg.query_port,
            rcon_port: cfg.rcon_port,
            rcon_password: cfg.rcon_password.clone(),
            console_stop_grace: cfg.console_stop_grace(),
            idle_timeout: cfg.idle_timeout(),
        }
    }
}

/// Everything the controller knows about the managed server.
#[derive(Debug, Clone)]
pub struct ServerLifecycle {
    pub state: ServerState,
    pub instance_id: String,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub startup_phase: Option<String>,
    pub idle: IdleTracker,
    pub maintenance_done: bool,
}

impl ServerLifecycle {
    fn new(instance_id: String) -> Self {
        Self {
            state: ServerState::Stopped,
            instance_id,
            public_address: None,
            private_address: None,
            startup_phase: None,
            idle: IdleTracker::default(),
            maintenance_done: false,
        }
    }

    /// Leaving `Running` always ends the idle episode; the phase only lives
    /// while starting or restarting.
    fn transition(&mut self, next: ServerState) {
        if self.state != next {
            tracing::info!(from = %self.state, to = %next, "lifecycle transition");
        }
        self.state = next;
        if next != ServerState::Running {
            self.idle.reset();
        }
        if !matches!(next, ServerState::Starting | ServerState::Maintaining) {
            self.startup_phase = None;
        }
    }

    fn set_addresses(&mut self, info: &InstanceInfo) {
        self.public_address = info.public_address.clone();
        self.private_address = info.private_address.clone();
    }

    fn clear_addresses(&mut self) {
        self.public_address = None;
        self.private_address = None;
    }
}

/// Proof that the caller owns the single sequence slot.
#[must_use]
pub struct SequenceGuard {
    _slot: OwnedMutexGuard<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Started { address: Option<String> },
    AlreadyRunning { address: Option<String> },
    Stopped,
    NotRunning,
    Restarted,
    Busy,
    Failed(LifecycleError),
}

impl Outcome {
    pub fn code(&self) -> &'static str {
        match self {
            Outcome::Started { .. } => "started",
            Outcome::AlreadyRunning { .. } => "already_running",
            Outcome::Stopped => "stopped",
            Outcome::NotRunning => "not_running",
            Outcome::Restarted => "restarted",
            Outcome::Busy => "busy",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Result of feeding one stats sample to the idle tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleCheck {
    pub idle_minutes: i64,
    pub timed_out: bool,
}

#[derive(Clone)]
pub struct LifecycleController {
    settings: Arc<ControllerSettings>,
    remotes: Remotes,
    reporter: StatusReporter,
    clock: Arc<dyn Clock>,
    lifecycle: Arc<Mutex<ServerLifecycle>>,
    sequence: Arc<Mutex<()>>,
}

async fn wait_for_sentinel(mut lines: mpsc::Receiver<String>, sentinel: &str) -> bool {
    while let Some(line) = lines.recv().await {
        if line.contains(sentinel) {
            return true;
        }
    }
    false
}

impl LifecycleController {
    pub fn new(
        settings: ControllerSettings,
        remotes: Remotes,
        reporter: StatusReporter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lifecycle = ServerLifecycle::new(settings.instance_id.clone());
        Self {
            settings: Arc::new(settings),
            remotes,
            reporter,
            clock,
            lifecycle: Arc::new(Mutex::new(lifecycle)),
            sequence: Arc::new(Mutex::new(())),
        }
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn snapshot(&self) -> ServerLifecycle {
        self.lifecycle.lock().await.clone()
    }

    pub async fn state(&self) -> ServerState {
        self.lifecycle.lock().await.state
    }

    /// Claims the sequence slot if nothing else holds it.
    pub fn try_begin(&self) -> Option<SequenceGuard> {
        self.sequence
            .clone()
            .try_lock_owned()
            .ok()
            .map(|slot| SequenceGuard { _slot: slot })
    }

    /// Rebuilds state from the cloud provider; nothing survives a restart.
    pub async fn bootstrap(&self) -> ServerState {
        match self.describe().await {
            Ok(info) => {
                let mut lc = self.lifecycle.lock().await;
                if info.state.is_running() {
                    lc.set_addresses(&info);
                    lc.transition(ServerState::Running);
                } else {
                    lc.clear_addresses();
                    lc.transition(ServerState::Stopped);
                }
                tracing::info!(cloud_state = %info.state, state = %lc.state, "bootstrapped lifecycle");
                lc.state
            }
            Err(err) => {
                tracing::warn!(%err, "bootstrap describe failed; assuming stopped");
                ServerState::Stopped
            }
        }
    }

    pub async fn describe(&self) -> LifecycleResult<InstanceInfo> {
        self.remotes
            .cloud
            .describe(&self.settings.instance_id)
            .await
            .map_err(|e| LifecycleError::remote("cloud.describe", &e))
    }

    pub async fn query_stats(&self) -> LifecycleResult<ObservedStats> {
        let address = {
            let lc = self.lifecycle.lock().await;
            lc.private_address.clone().or_else(|| lc.public_address.clone())
        };
        let Some(address) = address else {
            return Err(LifecycleError::InconsistentState(
                "running instance has no known address".to_string(),
            ));
        };
        self.remotes
            .stats
            .query_stats(&address, self.settings.query_port)
            .await
            .map_err(|e| LifecycleError::remote("stats.query", &e))
    }

    async fn set_phase(&self, phase: &str) {
        self.lifecycle.lock().await.startup_phase = Some(phase.to_string());
    }

    async fn transition(&self, next: ServerState) {
        self.lifecycle.lock().await.transition(next);
    }

    /// Progress goes to the requester only.
    async fn progress(&self, notify: Option<&Destination>, notice: Notice) {
        if let Some(d) = notify {
            self.reporter.send(d, &notice).await;
        }
    }

    /// Outcomes go to every registered context, and to the requester even
    /// when it is not registered.
    async fn announce(&self, notify: Option<&Destination>, notice: Notice) {
        let targets = self.reporter.registry().destinations().await;
        if let Some(d) = notify.filter(|d| !targets.contains(*d)) {
            self.reporter.send(d, &notice).await;
        }
        self.reporter.broadcast(&notice).await;
    }

    async fn reply_busy(&self, notify: Option<&Destination>) -> Outcome {
        self.progress(
            notify,
            Notice::text("Another start/stop operation is in progress, try again shortly"),
        )
        .await;
        Outcome::Busy
    }

    pub async fn request_start(&self, notify: Option<&Destination>) -> Outcome {
        match self.try_begin() {
            Some(guard) => self.start_sequence(guard, notify).await,
            None => self.reply_busy(notify).await,
        }
    }

    pub async fn request_stop(&self, notify: Option<&Destination>) -> Outcome {
        match self.try_begin() {
            Some(guard) => self.stop_sequence(guard, notify).await,
            None => self.reply_busy(notify).await,
        }
    }

    pub async fn request_restart(&self, notify: Option<&Destination>) -> Outcome {
        match self.try_begin() {
            Some(guard) => self.maintenance_sequence(guard, notify).await,
            None => self.reply_busy(notify).await,
        }
    }

    /// Replies to the requester only; a request with nowhere to reply just
    /// returns the report.
    pub async fn request_status(&self, notify: Option<&Destination>) -> StatusReport {
        let report = self.observe_status().await;
        if let Some(d) = notify {
            self.reporter.report(Some(d), &report).await;
        }
        report
    }

    pub async fn broadcast_status(&self) {
        let report = self.observe_status().await;
        self.reporter.report(None, &report).await;
    }

    pub async fn start_sequence(&self, _guard: SequenceGuard, notify: Option<&Destination>) -> Outcome {
        let info = match self.describe().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "start: describe failed");
                self.progress(notify, Notice::text(format!("Could not check the server: {err}")))
                    .await;
                return Outcome::Failed(err);
            }
        };

        if info.state.is_running() {
            let address = {
                let mut lc = self.lifecycle.lock().await;
                lc.set_addresses(&info);
                if lc.state != ServerState::Running {
                    lc.transition(ServerState::Running);
                }
                lc.public_address.clone()
            };
            let text = match &address {
                Some(a) => format!("The server is already running. Address: `{a}`"),
                None => "The server is already running".to_string(),
            };
            self.progress(notify, Notice::text(text)).await;
            return Outcome::AlreadyRunning { address };
        }

        self.progress(
            notify,
            Notice::text(
                "Starting the server... this can take 4-5 minutes. Use `status` to check progress",
            ),
        )
        .await;

        {
            let mut lc = self.lifecycle.lock().await;
            lc.transition(ServerState::Starting);
            lc.startup_phase = Some(PHASE_BOOTING.to_string());
        }

        match self.boot_and_launch().await {
            Ok(address) => {
                self.transition(ServerState::Running).await;
                let text = match &address {
                    Some(a) => format!("The server is up! Address: `{a}`"),
                    None => "The server is up!".to_string(),
                };
                self.announce(notify, Notice::text(text)).await;
                self.broadcast_status().await;
                Outcome::Started { address }
            }
            Err(err) => {
                tracing::warn!(%err, code = err.code(), "start sequence failed");
                self.release_after_failed_start().await;
                {
                    let mut lc = self.lifecycle.lock().await;
                    lc.clear_addresses();
                    lc.transition(ServerState::Stopped);
                }
                self.announce(notify, Notice::text(format!("The server failed to start: {err}")))
                    .await;
                Outcome::Failed(err)
            }
        }
    }

    /// Cloud boot, readiness wait, then process launch. Returns the public address.
    async fn boot_and_launch(&self) -> LifecycleResult<Option<String>> {
        let cloud = &self.remotes.cloud;
        let id = &self.settings.instance_id;

        cloud
            .start(id)
            .await
            .map_err(|e| LifecycleError::remote("cloud.start", &e))?;
        cloud
            .wait_until_running(id)
            .await
            .map_err(|e| LifecycleError::remote("cloud.wait_running", &e))?;

        self.set_phase(PHASE_PREPARING).await;
        cloud
            .wait_until_ready(id)
            .await
            .map_err(|e| LifecycleError::remote("cloud.wait_ready", &e))?;

        let info = self.describe().await?;
        if !info.state.is_running() {
            return Err(LifecycleError::InconsistentState(format!(
                "instance reported {} right after becoming ready",
                info.state
            )));
        }
        let launch_address = info
            .private_address
            .clone()
            .or_else(|| info.public_address.clone())
            .ok_or_else(|| {
                LifecycleError::InconsistentState("running instance has no address".to_string())
            })?;
        self.lifecycle.lock().await.set_addresses(&info);

        self.set_phase(PHASE_LAUNCHING).await;
        self.launch_game_server(&launch_address).await?;
        Ok(info.public_address)
    }

    /// Runs the launch command and waits, bounded, for the sentinel line.
    async fn launch_game_server(&self, address: &str) -> LifecycleResult<()> {
        let lines = self
            .remotes
            .launcher
            .launch(address, &self.settings.run_command)
            .await
            .map_err(|e| LifecycleError::remote("remote.launch", &e))?;

        let sentinel = self.settings.ready_sentinel.as_str();
        match tokio::time::timeout(self.settings.launch_timeout, wait_for_sentinel(lines, sentinel)).await {
            Ok(true) => {
                tracing::info!(%address, "game server reported ready");
                Ok(())
            }
            Ok(false) => Err(LifecycleError::RemoteCallFailed {
                call: "remote.launch",
                message: format!("output ended before `{sentinel}` appeared"),
            }),
            Err(_) => Err(LifecycleError::StartupTimeout(self.settings.launch_timeout)),
        }
    }

    /// A failed start may leave a booted instance behind; release it so the
    /// drift check does not adopt a server with no game process.
    async fn release_after_failed_start(&self) {
        let id = &self.settings.instance_id;
        let booted = match self.remotes.cloud.describe(id).await {
            Ok(info) => matches!(
                info.state,
                CloudState::Pending | CloudState::Running
            ),
            Err(err) => {
                tracing::warn!(%err, "could not check instance after failed start");
                false
            }
        };
        if !booted {
            return;
        }
        if let Err(err) = self.remotes.cloud.stop(id).await {
            tracing::warn!(%err, "failed to release instance after failed start");
        }
    }

    /// Best-effort in-game shutdown; failures are logged and swallowed.
    async fn console_stop(&self, address: Option<&str>) {
        let Some(address) = address else {
            tracing::warn!("no address for console stop; skipping");
            return;
        };
        match self
            .remotes
            .console
            .send_stop(address, self.settings.rcon_port, &self.settings.rcon_password)
            .await
        {
            Ok(ack) => {
                tracing::info!(%ack, "console stop acknowledged");
                if !self.settings.console_stop_grace.is_zero() {
                    tokio::time::sleep(self.settings.console_stop_grace).await;
                }
            }
            Err(err) => {
                let err = LifecycleError::remote("console.stop", &err);
                tracing::warn!(%err, "console stop failed; continuing");
            }
        }
    }

    async fn release_instance(&self) -> LifecycleResult<()> {
        let id = &self.settings.instance_id;
        self.remotes
            .cloud
            .stop(id)
            .await
            .map_err(|e| LifecycleError::remote("cloud.stop", &e))?;
        self.remotes
            .cloud
            .wait_until_stopped(id)
            .await
            .map_err(|e| LifecycleError::remote("cloud.wait_stopped", &e))
    }

    pub async fn stop_sequence(&self, _guard: SequenceGuard, notify: Option<&Destination>) -> Outcome {
        let info = match self.describe().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "stop: describe failed");
                self.progress(notify, Notice::text(format!("Could not check the server: {err}")))
                    .await;
                return Outcome::Failed(err);
            }
        };

        if !info.state.is_running() {
            {
                let mut lc = self.lifecycle.lock().await;
                if lc.state != ServerState::Stopped {
                    lc.clear_addresses();
                    lc.transition(ServerState::Stopped);
                }
            }
            self.progress(notify, Notice::text("The server is not running")).await;
            return Outcome::NotRunning;
        }

        self.progress(notify, Notice::text("Stopping the server...")).await;
        let console_address = {
            let mut lc = self.lifecycle.lock().await;
            if lc.private_address.is_none() {
                lc.set_addresses(&info);
            }
            lc.transition(ServerState::Stopping);
            lc.private_address.clone()
        };

        self.console_stop(console_address.as_deref()).await;
        self.finish_stop(notify).await
    }

    /// Releases the instance and settles the state. Call with the state
    /// already at `Stopping`.
    async fn finish_stop(&self, notify: Option<&Destination>) -> Outcome {
        match self.release_instance().await {
            Ok(()) => {
                {
                    let mut lc = self.lifecycle.lock().await;
                    lc.clear_addresses();
                    lc.transition(ServerState::Stopped);
                }
                self.announce(notify, Notice::text("The server has stopped")).await;
                self.broadcast_status().await;
                Outcome::Stopped
            }
            Err(err) => {
                tracing::warn!(%err, "stop sequence failed");
                let still_running = self
                    .describe()
                    .await
                    .map(|info| !matches!(info.state, CloudState::Stopped))
                    .unwrap_or(true);
                {
                    let mut lc = self.lifecycle.lock().await;
                    if still_running {
                        lc.transition(ServerState::Running);
                    } else {
                        lc.clear_addresses();
                        lc.transition(ServerState::Stopped);
                    }
                }
                self.announce(notify, Notice::text(format!("Failed to stop the server: {err}")))
                    .await;
                Outcome::Failed(err)
            }
        }
    }

    /// Idle auto-shutdown: explain why, then run the stop sequence.
    pub async fn auto_stop(&self, guard: SequenceGuard, idle_minutes: i64) -> Outcome {
        self.announce(
            None,
            Notice::text(format!(
                "Nobody has been online for {idle_minutes} minutes, stopping the server..."
            )),
        )
        .await;
        self.stop_sequence(guard, None).await
    }

    /// Restart in place: console stop, grace wait, relaunch; the instance is
    /// never released unless the relaunch fails.
    pub async fn maintenance_sequence(&self, _guard: SequenceGuard, notify: Option<&Destination>) -> Outcome {
        let address = {
            let mut lc = self.lifecycle.lock().await;
            if lc.state != ServerState::Running {
                drop(lc);
                self.progress(notify, Notice::text("The server is not running")).await;
                return Outcome::NotRunning;
            }
            lc.transition(ServerState::Maintaining);
            lc.startup_phase = Some(PHASE_MAINTENANCE.to_string());
            lc.private_address.clone().or_else(|| lc.public_address.clone())
        };

        self.announce(notify, Notice::text("Server maintenance in progress..."))
            .await;
        self.console_stop(address.as_deref()).await;

        let relaunched = match address.as_deref() {
            Some(a) => self.launch_game_server(a).await,
            None => Err(LifecycleError::InconsistentState(
                "running instance has no known address".to_string(),
            )),
        };

        match relaunched {
            Ok(()) => {
                self.transition(ServerState::Running).await;
                self.announce(notify, Notice::text("Server maintenance finished")).await;
                self.broadcast_status().await;
                Outcome::Restarted
            }
            Err(err) => {
                tracing::warn!(%err, "maintenance relaunch failed; releasing instance");
                self.announce(
                    notify,
                    Notice::text(format!(
                        "Maintenance restart failed ({err}); shutting the server down"
                    )),
                )
                .await;
                self.transition(ServerState::Stopping).await;
                match self.finish_stop(notify).await {
                    Outcome::Stopped => Outcome::Failed(err),
                    other => other,
                }
            }
        }
    }

    /// Renders current state plus live stats. Read-only.
    pub async fn observe_status(&self) -> StatusReport {
        let lc = self.snapshot().await;
        if let Some(phase) = lc.startup_phase.clone() {
            return StatusReport::Starting { phase: Some(phase) };
        }
        if lc.state == ServerState::Starting {
            return StatusReport::Starting { phase: None };
        }

        let info = match self.describe().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "status: describe failed");
                return StatusReport::ConnectionError;
            }
        };
        if !info.state.is_running() {
            return StatusReport::Stopped;
        }

        let address = lc.private_address.clone().or_else(|| info.private_address.clone());
        let Some(address) = address else {
            return StatusReport::ConnectionError;
        };
        match self
            .remotes
            .stats
            .query_stats(&address, self.settings.query_port)
            .await
        {
            Ok(stats) => {
                let idle_minutes = (stats.participant_count == 0)
                    .then(|| lc.idle.elapsed(self.now()).num_minutes());
                StatusReport::Running {
                    address: info.public_address.or(lc.public_address),
                    participants: stats.participant_count,
                    idle_minutes,
                }
            }
            Err(err) => {
                tracing::warn!(err = %LifecycleError::remote("stats.query", &err), "status: query failed");
                StatusReport::ConnectionError
            }
        }
    }

    /// Adopts the cloud's view when it contradicts ours and no sequence is in
    /// flight.
    pub async fn observe_cloud(&self, info: &InstanceInfo) {
        let Some(_guard) = self.try_begin() else {
            return;
        };
        let mut lc = self.lifecycle.lock().await;
        match (lc.state, info.state.is_running()) {
            (ServerState::Running, true) => lc.set_addresses(info),
            (ServerState::Running, false) => {
                let err = LifecycleError::InconsistentState(format!(
                    "controller says running, cloud says {}",
                    info.state
                ));
                tracing::warn!(%err, "adopting cloud state");
                lc.clear_addresses();
                lc.transition(ServerState::Stopped);
            }
            (ServerState::Stopped, true) => {
                let err = LifecycleError::InconsistentState(
                    "controller says stopped, cloud says running".to_string(),
                );
                tracing::warn!(%err, "adopting cloud state");
                lc.set_addresses(info);
                lc.transition(ServerState::Running);
            }
            // A sequence state with the slot free means the sequence that owned
            // it is gone; nothing else will ever move it on.
            (stale @ (ServerState::Starting | ServerState::Stopping | ServerState::Maintaining), up) => {
                let err = LifecycleError::InconsistentState(format!(
                    "controller says {stale} with no sequence in flight, cloud says {}",
                    info.state
                ));
                tracing::warn!(%err, "settling abandoned sequence from cloud state");
                if up {
                    lc.set_addresses(info);
                    lc.transition(ServerState::Running);
                } else {
                    lc.clear_addresses();
                    lc.transition(ServerState::Stopped);
                }
            }
            (ServerState::Stopped, false) => {}
        }
    }

    /// Feeds one stats sample. `None` when the server is not running.
    pub async fn record_stats(&self, participants: Option<u32>, now: DateTime<Utc>) -> Option<IdleCheck> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != ServerState::Running {
            return None;
        }
        lc.idle.observe(participants, now);
        Some(IdleCheck {
            idle_minutes: lc.idle.elapsed(now).num_minutes(),
            timed_out: lc.idle.timed_out(now, self.settings.idle_timeout),
        })
    }

    pub async fn maintenance_done(&self) -> bool {
        self.lifecycle.lock().await.maintenance_done
    }

    pub async fn set_maintenance_done(&self, done: bool) {
        self.lifecycle.lock().await.maintenance_done = done;
    }
}
