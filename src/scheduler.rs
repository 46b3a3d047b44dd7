//! Daily report scheduler: fires each subscriber's morning and evening report once per
//! local calendar day, inside a short window after the configured time.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::broker::MessageBroker;
use crate::storage;

pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const SEND_WINDOW_MINUTES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Morning,
    Evening,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Morning => "morning",
            ReportKind::Evening => "evening",
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_morning() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_evening() -> NaiveTime {
    NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// A report recipient with per-report enable flags and local times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub morning_report_enabled: bool,
    #[serde(default = "default_morning", with = "hhmm")]
    pub morning_report_time: NaiveTime,
    #[serde(default)]
    pub evening_report_enabled: bool,
    #[serde(default = "default_evening", with = "hhmm")]
    pub evening_report_time: NaiveTime,
}

impl Subscriber {
    fn schedule(&self) -> impl Iterator<Item = (ReportKind, NaiveTime)> {
        [
            (ReportKind::Morning, self.morning_report_enabled, self.morning_report_time),
            (ReportKind::Evening, self.evening_report_enabled, self.evening_report_time),
        ]
        .into_iter()
        .filter(|(_, enabled, _)| *enabled)
        .map(|(kind, _, time)| (kind, time))
    }
}

/// Subscriber timezone, or UTC when the name is not a known IANA zone.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = %name, "Unknown timezone, falling back to UTC");
        chrono_tz::UTC
    })
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// A report that should go out now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueReport {
    pub subscriber_id: i64,
    pub kind: ReportKind,
    pub local_date: NaiveDate,
    pub timezone: String,
}

#[async_trait]
pub trait SubscriberSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Subscriber>>;
}

#[async_trait]
pub trait ReportDispatcher: Send + Sync {
    async fn dispatch(&self, report: &DueReport) -> Result<()>;
}

/// Reads the subscriber list from a JSON array on disk; a missing file means nobody.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileSource { path: path.into() }
    }
}

#[async_trait]
impl SubscriberSource for JsonFileSource {
    async fn load(&self) -> Result<Vec<Subscriber>> {
        Ok(storage::read_json::<Vec<Subscriber>>(&self.path)?.unwrap_or_default())
    }
}

/// Hands due reports to the renderer over the broker.
pub struct BrokerDispatcher {
    broker: Arc<dyn MessageBroker>,
}

impl BrokerDispatcher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        BrokerDispatcher { broker }
    }
}

pub fn report_topic(report: &DueReport) -> String {
    format!("users/{}/reports/{}", report.subscriber_id, report.kind.as_str())
}

#[async_trait]
impl ReportDispatcher for BrokerDispatcher {
    async fn dispatch(&self, report: &DueReport) -> Result<()> {
        let payload = serde_json::to_vec(report)?;
        self.broker.publish(&report_topic(report), payload, false).await
    }
}

/// Remembers, per subscriber and report kind, the local date of the last delivery.
#[derive(Debug, Default)]
pub struct ReportScheduler {
    last_sent: HashMap<(i64, ReportKind), NaiveDate>,
}

impl ReportScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_send(
        &self,
        subscriber_id: i64,
        kind: ReportKind,
        scheduled: NaiveTime,
        local_now: NaiveTime,
        local_date: NaiveDate,
    ) -> bool {
        let start = minute_of_day(scheduled);
        let current = minute_of_day(local_now);
        if !(start <= current && current < start + SEND_WINDOW_MINUTES) {
            return false;
        }
        self.last_sent.get(&(subscriber_id, kind)) != Some(&local_date)
    }

    pub fn due(&self, subscribers: &[Subscriber], now: DateTime<Utc>) -> Vec<DueReport> {
        let mut due = Vec::new();
        for subscriber in subscribers.iter().filter(|s| s.is_active) {
            let local = now.with_timezone(&resolve_timezone(&subscriber.timezone));
            let (date, time) = (local.date_naive(), local.time());
            for (kind, scheduled) in subscriber.schedule() {
                if self.should_send(subscriber.id, kind, scheduled, time, date) {
                    due.push(DueReport {
                        subscriber_id: subscriber.id,
                        kind,
                        local_date: date,
                        timezone: subscriber.timezone.clone(),
                    });
                }
            }
        }
        due
    }

    pub fn mark_sent(&mut self, report: &DueReport) {
        self.last_sent
            .insert((report.subscriber_id, report.kind), report.local_date);
    }

    /// One pass over all subscribers. Only successful deliveries are remembered, so a
    /// failed one is retried on the next pass while the window is still open.
    pub async fn scan(
        &mut self,
        source: &dyn SubscriberSource,
        dispatcher: &dyn ReportDispatcher,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let subscribers = source.load().await?;
        let mut sent = 0;
        for report in self.due(&subscribers, now) {
            match dispatcher.dispatch(&report).await {
                Ok(()) => {
                    info!(
                        subscriber = report.subscriber_id,
                        kind = report.kind.as_str(),
                        "Report dispatched"
                    );
                    self.mark_sent(&report);
                    sent += 1;
                }
                Err(e) => error!(
                    subscriber = report.subscriber_id,
                    kind = report.kind.as_str(),
                    error = %e,
                    "Failed to dispatch report"
                ),
            }
        }
        Ok(sent)
    }

    /// Scans every [`SCAN_INTERVAL`] until `shutdown` resolves.
    pub async fn run(
        mut self,
        source: &dyn SubscriberSource,
        dispatcher: &dyn ReportDispatcher,
        shutdown: impl Future<Output = ()>,
    ) {
        info!("Report scheduler started");
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(source, dispatcher, Utc::now()).await {
                        error!(error = %e, "Scheduler error");
                    }
                }
                _ = &mut shutdown => {
                    info!("Report scheduler stopped");
                    return;
                }
            }
        }
    }
}
