//! In-memory collaborators for controller and loop tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use beacon_lifecycle::{CloudState, InstanceInfo, ObservedStats};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::adapters::{Clock, CloudCompute, Notifier, RemoteConsole, RemoteLauncher, Remotes, StatsQuery};
use crate::controller::{ControllerSettings, LifecycleController};
use crate::notify::{ContextId, Destination, Notice, NotificationRegistry};
use crate::status::StatusReporter;

pub(crate) const INSTANCE: &str = "i-0123456789abcdef0";
pub(crate) const PUBLIC_IP: &str = "203.0.113.7";
pub(crate) const PRIVATE_IP: &str = "10.0.1.23";

#[derive(Default)]
pub(crate) struct FakeCloud {
    state: Mutex<Option<CloudState>>,
    pub(crate) fail_start: Mutex<bool>,
    pub(crate) fail_stop: Mutex<bool>,
    pub(crate) fail_describe: Mutex<bool>,
    pub(crate) starts: AtomicUsize,
    pub(crate) stops: AtomicUsize,
}

impl FakeCloud {
    pub(crate) fn with_state(state: CloudState) -> Self {
        let cloud = Self::default();
        cloud.set_state(state);
        cloud
    }

    pub(crate) fn set_state(&self, state: CloudState) {
        *self.state.lock().unwrap() = Some(state);
    }

    pub(crate) fn current(&self) -> CloudState {
        self.state.lock().unwrap().clone().unwrap_or(CloudState::Stopped)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CloudCompute for FakeCloud {
    async fn start(&self, instance_id: &str) -> anyhow::Result<()> {
        assert_eq!(instance_id, INSTANCE);
        self.starts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_start.lock().unwrap() {
            anyhow::bail!("InsufficientInstanceCapacity");
        }
        self.set_state(CloudState::Pending);
        Ok(())
    }

    async fn stop(&self, _instance_id: &str) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if *self.fail_stop.lock().unwrap() {
            anyhow::bail!("RequestLimitExceeded");
        }
        self.set_state(CloudState::Stopping);
        Ok(())
    }

    async fn wait_until_running(&self, _instance_id: &str) -> anyhow::Result<()> {
        self.set_state(CloudState::Running);
        Ok(())
    }

    async fn wait_until_ready(&self, _instance_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_until_stopped(&self, _instance_id: &str) -> anyhow::Result<()> {
        self.set_state(CloudState::Stopped);
        Ok(())
    }

    async fn describe(&self, _instance_id: &str) -> anyhow::Result<InstanceInfo> {
        if *self.fail_describe.lock().unwrap() {
            anyhow::bail!("describe throttled");
        }
        let state = self.current();
        let running = state.is_running();
        Ok(InstanceInfo {
            state,
            public_address: running.then(|| PUBLIC_IP.to_string()),
            private_address: Some(PRIVATE_IP.to_string()),
        })
    }
}

/// Emits `lines` for every launch; `hold_open` keeps the stream alive
/// afterwards instead of closing it.
pub(crate) struct FakeLauncher {
    lines: Vec<String>,
    hold_open: bool,
    held: Mutex<Vec<mpsc::Sender<String>>>,
    pub(crate) launches: AtomicUsize,
}

impl FakeLauncher {
    pub(crate) fn ready() -> Self {
        Self::emitting(&["Starting minecraft server", "Done (12.345s)! For help, type \"help\""], false)
    }

    pub(crate) fn emitting(lines: &[&str], hold_open: bool) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            hold_open,
            held: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RemoteLauncher for FakeLauncher {
    async fn launch(&self, address: &str, _command: &str) -> anyhow::Result<mpsc::Receiver<String>> {
        assert_eq!(address, PRIVATE_IP);
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        for line in &self.lines {
            tx.try_send(line.clone()).unwrap();
        }
        if self.hold_open {
            self.held.lock().unwrap().push(tx);
        }
        Ok(rx)
    }
}

/// `None` makes the query fail.
pub(crate) struct FakeStats {
    players: Mutex<Option<u32>>,
}

impl FakeStats {
    pub(crate) fn new(players: Option<u32>) -> Self {
        Self {
            players: Mutex::new(players),
        }
    }

    pub(crate) fn set(&self, players: Option<u32>) {
        *self.players.lock().unwrap() = players;
    }
}

#[async_trait::async_trait]
impl StatsQuery for FakeStats {
    async fn query_stats(&self, _address: &str, _port: u16) -> anyhow::Result<ObservedStats> {
        match *self.players.lock().unwrap() {
            Some(n) => Ok(ObservedStats::with_count(n)),
            None => anyhow::bail!("query timed out"),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeConsole {
    pub(crate) fail: Mutex<bool>,
    pub(crate) stops: AtomicUsize,
}

impl FakeConsole {
    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RemoteConsole for FakeConsole {
    async fn send_stop(&self, _address: &str, _port: u16, _password: &str) -> anyhow::Result<String> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            anyhow::bail!("connection refused");
        }
        Ok("Stopping the server".to_string())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    /// `(destination, description)` pairs in delivery order.
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn any_contains(&self, needle: &str) -> bool {
        self.sent().iter().any(|(_, text)| text.contains(needle))
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, destination: &Destination, notice: &Notice) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.0.clone(), notice.description.clone()));
        Ok(())
    }
}

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub(crate) fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub(crate) fn settings() -> ControllerSettings {
    ControllerSettings {
        instance_id: INSTANCE.to_string(),
        run_command: "tmux new -d ./run.sh; tail -F logs/latest.log".to_string(),
        ready_sentinel: "Done".to_string(),
        launch_timeout: Duration::from_millis(200),
        query_port: 25565,
        rcon_port: 25575,
        rcon_password: "hunter2".to_string(),
        console_stop_grace: Duration::ZERO,
        idle_timeout: Duration::from_secs(5 * 60),
    }
}

pub(crate) struct Harness {
    pub(crate) controller: LifecycleController,
    pub(crate) cloud: Arc<FakeCloud>,
    pub(crate) launcher: Arc<FakeLauncher>,
    pub(crate) stats: Arc<FakeStats>,
    pub(crate) console: Arc<FakeConsole>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Harness {
    pub(crate) async fn new(cloud: FakeCloud, launcher: FakeLauncher) -> Self {
        let cloud = Arc::new(cloud);
        let launcher = Arc::new(launcher);
        let stats = Arc::new(FakeStats::new(Some(0)));
        let console = Arc::new(FakeConsole::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::at(noon()));

        let registry = NotificationRegistry::new();
        registry
            .register(ContextId("guild-1".into()), Destination("hook-1".into()))
            .await;
        let reporter = StatusReporter::new(registry, notifier.clone(), 5, "04:00");
        let remotes = Remotes {
            cloud: cloud.clone(),
            launcher: launcher.clone(),
            stats: stats.clone(),
            console: console.clone(),
        };
        let controller = LifecycleController::new(settings(), remotes, reporter, clock.clone());
        controller.bootstrap().await;

        Self {
            controller,
            cloud,
            launcher,
            stats,
            console,
            notifier,
            clock,
        }
    }

    pub(crate) async fn stopped() -> Self {
        Self::new(FakeCloud::with_state(CloudState::Stopped), FakeLauncher::ready()).await
    }

    pub(crate) async fn running() -> Self {
        Self::new(FakeCloud::with_state(CloudState::Running), FakeLauncher::ready()).await
    }
}
