use std::sync::Arc;

use beacon_lifecycle::StatusReport;

use crate::adapters::Notifier;
use crate::idle::minutes_until_shutdown;
use crate::notify::{Destination, Notice, NotificationRegistry};

pub const STATUS_TITLE: &str = "Minecraft Server Status";

pub const COLOR_PENDING: u32 = 0xff9932;
pub const COLOR_RUNNING: u32 = 0x65ff32;
pub const COLOR_ERROR: u32 = 0xff3232;

pub fn render_status(report: &StatusReport, idle_timeout_minutes: u32, maintenance_time: &str) -> Notice {
    match report {
        StatusReport::Starting { phase } => {
            let text = match phase {
                Some(p) => format!("Server is starting... {p}"),
                None => "Server is starting...".to_string(),
            };
            Notice::embed(STATUS_TITLE, COLOR_PENDING, text)
        }
        StatusReport::Stopped => Notice::embed(STATUS_TITLE, COLOR_PENDING, "Server is stopped"),
        StatusReport::Running {
            address,
            participants,
            idle_minutes,
        } => {
            let mut text = match address {
                Some(a) => format!("Server is running at `{a}`\n"),
                None => "Server is running\n".to_string(),
            };
            text.push_str(&format!("{participants} player(s) online\n"));
            if *participants == 0 {
                let elapsed = idle_minutes.unwrap_or(0);
                text.push_str(&format!(
                    "The server shuts down after {idle_timeout_minutes} minutes with nobody online \
                     ({elapsed} minutes elapsed, {} minutes until shutdown)\n",
                    minutes_until_shutdown(idle_timeout_minutes, elapsed)
                ));
            }
            text.push_str(&format!("Daily maintenance restart at `{maintenance_time}`"));
            Notice::embed(STATUS_TITLE, COLOR_RUNNING, text)
        }
        StatusReport::ConnectionError => Notice::embed(
            STATUS_TITLE,
            COLOR_ERROR,
            "Server connection error",
        ),
    }
}

/// Delivers notices to one requester or to every registered context.
/// Owns the notification registry; never touches lifecycle state.
#[derive(Clone)]
pub struct StatusReporter {
    registry: NotificationRegistry,
    notifier: Arc<dyn Notifier>,
    idle_timeout_minutes: u32,
    maintenance_time: String,
}

impl StatusReporter {
    pub fn new(
        registry: NotificationRegistry,
        notifier: Arc<dyn Notifier>,
        idle_timeout_minutes: u32,
        maintenance_time: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            notifier,
            idle_timeout_minutes,
            maintenance_time: maintenance_time.into(),
        }
    }

    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    pub fn render(&self, report: &StatusReport) -> Notice {
        render_status(report, self.idle_timeout_minutes, &self.maintenance_time)
    }

    pub async fn send(&self, destination: &Destination, notice: &Notice) {
        if let Err(err) = self.notifier.send(destination, notice).await {
            tracing::warn!(err = %crate::support::format_error_chain(&err), "failed to deliver notice");
        }
    }

    pub async fn broadcast(&self, notice: &Notice) {
        for destination in self.registry.destinations().await {
            self.send(&destination, notice).await;
        }
    }

    /// Sends to the requester, or to everyone for internally triggered work.
    pub async fn reply(&self, destination: Option<&Destination>, notice: &Notice) {
        match destination {
            Some(d) => self.send(d, notice).await,
            None => self.broadcast(notice).await,
        }
    }

    pub async fn report(&self, destination: Option<&Destination>, report: &StatusReport) {
        self.reply(destination, &self.render(report)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ContextId;
    use crate::testing::RecordingNotifier;

    #[test]
    fn empty_server_reports_minutes_until_shutdown() {
        let report = StatusReport::Running {
            address: Some("203.0.113.7".to_string()),
            participants: 0,
            idle_minutes: Some(4),
        };
        let notice = render_status(&report, 10, "04:00");
        assert_eq!(notice.color, Some(COLOR_RUNNING));
        assert!(notice.description.contains("`203.0.113.7`"));
        assert!(notice.description.contains("after 10 minutes"));
        assert!(notice.description.contains("4 minutes elapsed"));
        assert!(notice.description.contains("6 minutes until shutdown"));
        assert!(notice.description.contains("`04:00`"));
    }

    #[test]
    fn busy_server_omits_shutdown_countdown() {
        let report = StatusReport::Running {
            address: None,
            participants: 3,
            idle_minutes: None,
        };
        let notice = render_status(&report, 10, "04:00");
        assert!(notice.description.contains("3 player(s) online"));
        assert!(!notice.description.contains("until shutdown"));
    }

    #[test]
    fn other_states_use_their_colors() {
        let starting = render_status(
            &StatusReport::Starting {
                phase: Some("1/4 booting cloud instance".to_string()),
            },
            10,
            "04:00",
        );
        assert_eq!(starting.color, Some(COLOR_PENDING));
        assert!(starting.description.ends_with("1/4 booting cloud instance"));

        assert_eq!(
            render_status(&StatusReport::Stopped, 10, "04:00").color,
            Some(COLOR_PENDING)
        );
        assert_eq!(
            render_status(&StatusReport::ConnectionError, 10, "04:00").color,
            Some(COLOR_ERROR)
        );
    }

    #[tokio::test]
    async fn reply_without_destination_broadcasts() {
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = NotificationRegistry::new();
        registry
            .register(ContextId("a".into()), Destination("hook-a".into()))
            .await;
        registry
            .register(ContextId("b".into()), Destination("hook-b".into()))
            .await;
        let reporter = StatusReporter::new(registry, notifier.clone(), 10, "04:00");

        reporter.reply(None, &Notice::text("hello")).await;
        reporter
            .reply(Some(&Destination("hook-a".into())), &Notice::text("only a"))
            .await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], ("hook-a".to_string(), "only a".to_string()));
    }
}
