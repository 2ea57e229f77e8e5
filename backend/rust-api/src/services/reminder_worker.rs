use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    config::Config, metrics::REMINDER_WORKER_TICKS_TOTAL,
    services::notification_service::NotificationService,
};

/// Next occurrence of `hour:00` in the given fixed UTC offset, strictly after
/// `now`. Hours above 23 clamp to 23.
pub fn next_run_after(now: DateTime<Utc>, hour: u32, utc_offset_hours: i32) -> DateTime<Utc> {
    let offset = chrono::Duration::hours(i64::from(utc_offset_hours));
    // Shift into the configured wall clock, schedule there, shift back.
    let local = now + offset;
    let target = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();

    let mut candidate = local.date_naive().and_time(target).and_utc();
    if candidate <= local {
        candidate += chrono::Duration::days(1);
    }
    candidate - offset
}

/// Background loop with two cadences: a frequent sweep for assignments whose
/// invitation email never went out, and a daily deadline-reminder batch.
pub struct ReminderWorker {
    notification: NotificationService,
    config: Config,
}

impl ReminderWorker {
    pub fn new(notification: NotificationService, config: Config) -> Self {
        Self {
            notification,
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.reminder.sweep_interval_secs);
        let mut next_daily = next_run_after(
            Utc::now(),
            self.config.reminder.daily_hour,
            self.config.reminder.utc_offset_hours,
        );
        info!(
            "Starting reminder worker loop (sweep every {}s, daily batch at {:02}:00 UTC{:+}, next at {})",
            interval.as_secs(),
            self.config.reminder.daily_hour,
            self.config.reminder.utc_offset_hours,
            next_daily
        );

        loop {
            match self.run_once(&mut next_daily).await {
                Ok(()) => {
                    REMINDER_WORKER_TICKS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                }
                Err(err) => {
                    REMINDER_WORKER_TICKS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    warn!(error = %err, "Reminder worker tick failed");
                }
            }

            sleep(interval).await;
        }
    }

    async fn run_once(&self, next_daily: &mut DateTime<Utc>) -> Result<()> {
        self.notification.sweep_unsent().await?;

        let now = Utc::now();
        if now >= *next_daily {
            let summary = self.notification.send_deadline_reminders(now).await?;
            info!(
                "Daily reminder batch done ({} sent, {} failed)",
                summary.sent, summary.failed
            );
            *next_daily = next_run_after(
                now,
                self.config.reminder.daily_hour,
                self.config.reminder.utc_offset_hours,
            );
        }

        Ok(())
    }
}
