// Core data structures for recurring series and generated documents

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::scheduler::calendar::{parse_timezone, to_local};
use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::scheduler::frequency::{first_scheduled_date, validate_frequency_params, ScheduleParams};

/// Default number of days between issue date and due date
pub const DEFAULT_DUE_DATE_OFFSET: u32 = 30;

/// Default timezone for series created without one
pub const DEFAULT_TIMEZONE: &str = "UTC";

// ============================================================================
// Enumerations
// ============================================================================

/// How often a series generates a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Every week on `frequency_day` (0 = Sunday)
    Weekly,
    /// Accepted for storage; no date calculation rule
    Biweekly,
    /// Every month on `frequency_day` (1-31, clamped)
    MonthlyDate,
    /// Every month on the Nth `frequency_day` weekday
    MonthlyWeekday,
    /// Accepted for storage; no date calculation rule
    MonthlyLastDay,
    /// Every 3 months
    Quarterly,
    /// Every 6 months
    SemiAnnual,
    /// Every 12 months
    Annual,
    /// Every `frequency_interval` days
    Custom,
}

impl Frequency {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::MonthlyDate => "monthly_date",
            Self::MonthlyWeekday => "monthly_weekday",
            Self::MonthlyLastDay => "monthly_last_day",
            Self::Quarterly => "quarterly",
            Self::SemiAnnual => "semi_annual",
            Self::Annual => "annual",
            Self::Custom => "custom",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Weekly => "Weekly",
            Self::Biweekly => "Bi-weekly",
            Self::MonthlyDate => "Monthly",
            Self::MonthlyWeekday => "Monthly",
            Self::MonthlyLastDay => "Monthly",
            Self::Quarterly => "Quarterly",
            Self::SemiAnnual => "Semi-annually",
            Self::Annual => "Annually",
            Self::Custom => "Custom",
        }
    }

    /// All persisted frequency values
    pub fn all() -> [Self; 9] {
        [
            Self::Weekly,
            Self::Biweekly,
            Self::MonthlyDate,
            Self::MonthlyWeekday,
            Self::MonthlyLastDay,
            Self::Quarterly,
            Self::SemiAnnual,
            Self::Annual,
            Self::Custom,
        ]
    }

    /// Whether the date calculator has a rule for this frequency
    pub fn is_schedulable(&self) -> bool {
        !matches!(self, Self::Biweekly | Self::MonthlyLastDay)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| SchedulerError::validation("frequency", format!("unknown value '{s}'")))
    }
}

/// How a series ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndType {
    #[default]
    Never,
    OnDate,
    AfterCount,
}

impl EndType {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::OnDate => "on_date",
            Self::AfterCount => "after_count",
        }
    }
}

impl fmt::Display for EndType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "on_date" => Ok(Self::OnDate),
            "after_count" => Ok(Self::AfterCount),
            _ => Err(SchedulerError::validation(
                "end_type",
                format!("unknown value '{s}'"),
            )),
        }
    }
}

/// Lifecycle status of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    Active,
    Paused,
    Completed,
    Canceled,
}

impl SeriesStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Completed and canceled series never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }

    /// Statuses that carry a `next_scheduled_at`
    pub fn has_schedule(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl fmt::Display for SeriesStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeriesStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(SchedulerError::validation(
                "status",
                format!("unknown value '{s}'"),
            )),
        }
    }
}

/// Status of a generated document slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Claimed, dispatch in progress
    Pending,
    /// Dispatch acknowledged
    Generated,
    /// Dispatch failed; may be reclaimed
    Failed,
}

impl DocumentStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generated => "generated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "generated" => Ok(Self::Generated),
            "failed" => Ok(Self::Failed),
            _ => Err(SchedulerError::validation(
                "document_status",
                format!("unknown value '{s}'"),
            )),
        }
    }
}

// ============================================================================
// End Condition
// ============================================================================

/// End condition of a series
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EndCondition {
    pub end_type: EndType,
    pub end_date: Option<DateTime<Utc>>,
    pub end_count: Option<u32>,
}

impl EndCondition {
    /// Series without an end
    pub fn never() -> Self {
        Self::default()
    }

    /// Series ending once an occurrence would fall after `date`
    pub fn on_date(date: DateTime<Utc>) -> Self {
        Self {
            end_type: EndType::OnDate,
            end_date: Some(date),
            end_count: None,
        }
    }

    /// Series ending after `count` documents
    pub fn after_count(count: u32) -> Self {
        Self {
            end_type: EndType::AfterCount,
            end_date: None,
            end_count: Some(count),
        }
    }

    /// Reject end conditions missing their required value
    pub fn validate(&self) -> SchedulerResult<()> {
        match self.end_type {
            EndType::Never => Ok(()),
            EndType::OnDate => {
                if self.end_date.is_none() {
                    return Err(SchedulerError::validation(
                        "end_date",
                        "required when end_type is on_date",
                    ));
                }
                Ok(())
            }
            EndType::AfterCount => match self.end_count {
                None => Err(SchedulerError::validation(
                    "end_count",
                    "required when end_type is after_count",
                )),
                Some(0) => Err(SchedulerError::validation("end_count", "must be at least 1")),
                Some(_) => Ok(()),
            },
        }
    }
}

// ============================================================================
// Template Payload
// ============================================================================

/// Opaque template and pricing data copied into every generated document
///
/// The scheduler never interprets these values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplatePayload {
    #[serde(default)]
    pub line_items: serde_json::Value,
    #[serde(default)]
    pub template: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_block: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom_block: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// Recurring Series
// ============================================================================

/// A recurring document configuration and its live scheduling state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: String,
    pub team_id: String,
    pub user_id: String,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,

    pub frequency: Frequency,
    pub frequency_day: Option<u32>,
    pub frequency_week: Option<u32>,
    pub frequency_interval: Option<u32>,
    pub timezone: String,
    pub due_date_offset: u32,

    pub end_type: EndType,
    pub end_date: Option<DateTime<Utc>>,
    pub end_count: Option<u32>,

    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub payload: TemplatePayload,

    pub status: SeriesStatus,
    pub invoices_generated: u32,
    pub consecutive_failures: u32,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub upcoming_notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringSeries {
    /// Build a new active series from validated input
    pub fn create(draft: SeriesDraft, now: DateTime<Utc>) -> SchedulerResult<Self> {
        draft.validate()?;

        let issue_date = draft.issue_date.unwrap_or(now);
        let next_scheduled_at = first_scheduled_date(issue_date, now);

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            team_id: draft.team_id,
            user_id: draft.user_id,
            customer_id: draft.customer_id,
            customer_name: draft.customer_name,
            frequency: draft.frequency,
            frequency_day: draft.frequency_day,
            frequency_week: draft.frequency_week,
            frequency_interval: draft.frequency_interval,
            timezone: draft.timezone,
            due_date_offset: draft.due_date_offset.unwrap_or(DEFAULT_DUE_DATE_OFFSET),
            end_type: draft.end_type,
            end_date: draft.end_date,
            end_count: draft.end_count,
            amount: draft.amount,
            currency: draft.currency,
            payload: draft.payload,
            status: SeriesStatus::Active,
            invoices_generated: 0,
            consecutive_failures: 0,
            next_scheduled_at: Some(next_scheduled_at),
            last_generated_at: None,
            upcoming_notification_sent_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Calculator parameters for this series
    pub fn schedule_params(&self) -> SchedulerResult<ScheduleParams> {
        Ok(ScheduleParams {
            frequency: self.frequency,
            day: self.frequency_day,
            week: self.frequency_week,
            interval: self.frequency_interval,
            timezone: parse_timezone(&self.timezone)?,
        })
    }

    /// End condition of this series
    pub fn end_condition(&self) -> EndCondition {
        EndCondition {
            end_type: self.end_type,
            end_date: self.end_date,
            end_count: self.end_count,
        }
    }

    /// Sequence number of the next document this series will generate
    pub fn next_sequence(&self) -> u32 {
        self.invoices_generated + 1
    }

    /// Whether the series is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SeriesStatus::Active
            && self.next_scheduled_at.is_some_and(|next| next <= now)
    }

    /// Issue and due dates for a document scheduled at `scheduled_at`
    ///
    /// Issue date is the scheduled instant's civil date in the series
    /// timezone, stored as UTC midnight of that date.
    pub fn document_dates(&self, scheduled_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let civil_date = parse_timezone(&self.timezone)
            .map(|tz| to_local(scheduled_at, tz).date())
            .unwrap_or_else(|_| scheduled_at.date_naive());
        let issue_date = civil_date.and_time(NaiveTime::MIN).and_utc();
        let due_date = issue_date + Duration::days(i64::from(self.due_date_offset));
        (issue_date, due_date)
    }

    /// Human readable schedule, e.g. "Monthly on the 15th"
    pub fn describe_schedule(&self) -> String {
        describe_schedule(
            self.frequency,
            self.frequency_day,
            self.frequency_week,
            self.frequency_interval,
        )
    }
}

/// Human readable description of a frequency and its parameters
pub fn describe_schedule(
    frequency: Frequency,
    day: Option<u32>,
    week: Option<u32>,
    interval: Option<u32>,
) -> String {
    const WEEKDAYS: [&str; 7] = [
        "Sunday",
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
    ];
    let weekday = |d: Option<u32>| WEEKDAYS[d.unwrap_or(0).min(6) as usize];

    match frequency {
        Frequency::Weekly => format!("Weekly on {}", weekday(day)),
        Frequency::Biweekly => format!("Bi-weekly on {}", weekday(day)),
        Frequency::MonthlyDate => format!("Monthly on the {}", ordinal(day.unwrap_or(1))),
        Frequency::MonthlyWeekday => format!(
            "Monthly on the {} {}",
            ordinal(week.unwrap_or(1)),
            weekday(day)
        ),
        Frequency::MonthlyLastDay => "Monthly on the last day".to_string(),
        Frequency::Quarterly | Frequency::SemiAnnual | Frequency::Annual => match day {
            Some(d) => format!("{} on the {}", frequency.label(), ordinal(d)),
            None => frequency.label().to_string(),
        },
        Frequency::Custom => match interval.unwrap_or(1) {
            1 => "Every day".to_string(),
            n => format!("Every {n} days"),
        },
    }
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

// ============================================================================
// Series Input
// ============================================================================

/// Input for creating a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesDraft {
    pub team_id: String,
    pub user_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,

    pub frequency: Frequency,
    #[serde(default)]
    pub frequency_day: Option<u32>,
    #[serde(default)]
    pub frequency_week: Option<u32>,
    #[serde(default)]
    pub frequency_interval: Option<u32>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub due_date_offset: Option<u32>,

    #[serde(default)]
    pub end_type: EndType,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_count: Option<u32>,

    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payload: TemplatePayload,

    /// Issue date of the first document; defaults to now
    #[serde(default)]
    pub issue_date: Option<DateTime<Utc>>,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

impl SeriesDraft {
    /// Minimal draft for a team, user and frequency
    pub fn new(team_id: impl Into<String>, user_id: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            team_id: team_id.into(),
            user_id: user_id.into(),
            customer_id: None,
            customer_name: None,
            frequency,
            frequency_day: None,
            frequency_week: None,
            frequency_interval: None,
            timezone: default_timezone(),
            due_date_offset: None,
            end_type: EndType::Never,
            end_date: None,
            end_count: None,
            amount: None,
            currency: None,
            payload: TemplatePayload::default(),
            issue_date: None,
        }
    }

    /// Set day parameter
    pub fn day(mut self, day: u32) -> Self {
        self.frequency_day = Some(day);
        self
    }

    /// Set week parameter
    pub fn week(mut self, week: u32) -> Self {
        self.frequency_week = Some(week);
        self
    }

    /// Set interval parameter
    pub fn interval(mut self, interval: u32) -> Self {
        self.frequency_interval = Some(interval);
        self
    }

    /// Set timezone
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    /// Set end condition
    pub fn ending(mut self, end: EndCondition) -> Self {
        self.end_type = end.end_type;
        self.end_date = end.end_date;
        self.end_count = end.end_count;
        self
    }

    /// Set amount and currency
    pub fn priced(mut self, amount: f64, currency: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    /// Set first issue date
    pub fn issue_date(mut self, issue_date: DateTime<Utc>) -> Self {
        self.issue_date = Some(issue_date);
        self
    }

    /// Validate all fields before persistence
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.team_id.trim().is_empty() {
            return Err(SchedulerError::validation("team_id", "must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(SchedulerError::validation("user_id", "must not be empty"));
        }
        parse_timezone(&self.timezone)?;
        validate_frequency_params(
            self.frequency,
            self.frequency_day,
            self.frequency_week,
            self.frequency_interval,
        )?;
        EndCondition {
            end_type: self.end_type,
            end_date: self.end_date,
            end_count: self.end_count,
        }
        .validate()?;
        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(SchedulerError::validation(
                    "amount",
                    "must be a non-negative number",
                ));
            }
        }
        Ok(())
    }
}

/// Partial update of a series configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesPatch {
    pub customer_name: Option<String>,
    pub frequency: Option<Frequency>,
    pub frequency_day: Option<u32>,
    pub frequency_week: Option<u32>,
    pub frequency_interval: Option<u32>,
    pub timezone: Option<String>,
    pub due_date_offset: Option<u32>,
    pub end_type: Option<EndType>,
    pub end_date: Option<DateTime<Utc>>,
    pub end_count: Option<u32>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub payload: Option<TemplatePayload>,
}

impl SeriesPatch {
    /// Whether any field feeding the date calculator changes
    pub fn touches_schedule(&self) -> bool {
        self.frequency.is_some()
            || self.frequency_day.is_some()
            || self.frequency_week.is_some()
            || self.frequency_interval.is_some()
            || self.timezone.is_some()
    }

    /// Merge the patch into a copy of `series`
    pub fn apply_to(&self, series: &RecurringSeries) -> RecurringSeries {
        let mut merged = series.clone();

        if let Some(name) = &self.customer_name {
            merged.customer_name = Some(name.clone());
        }
        if let Some(frequency) = self.frequency {
            merged.frequency = frequency;
        }
        if let Some(day) = self.frequency_day {
            merged.frequency_day = Some(day);
        }
        if let Some(week) = self.frequency_week {
            merged.frequency_week = Some(week);
        }
        if let Some(interval) = self.frequency_interval {
            merged.frequency_interval = Some(interval);
        }
        if let Some(tz) = &self.timezone {
            merged.timezone = tz.clone();
        }
        if let Some(offset) = self.due_date_offset {
            merged.due_date_offset = offset;
        }
        if let Some(end_type) = self.end_type {
            merged.end_type = end_type;
        }
        if let Some(end_date) = self.end_date {
            merged.end_date = Some(end_date);
        }
        if let Some(end_count) = self.end_count {
            merged.end_count = Some(end_count);
        }
        if let Some(amount) = self.amount {
            merged.amount = Some(amount);
        }
        if let Some(currency) = &self.currency {
            merged.currency = Some(currency.clone());
        }
        if let Some(payload) = &self.payload {
            merged.payload = payload.clone();
        }

        merged
    }
}

// ============================================================================
// Generated Document
// ============================================================================

/// One generated document slot, unique per (series, sequence)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: String,
    pub series_id: Option<String>,
    pub sequence: u32,
    pub status: DocumentStatus,
    pub attempts: u32,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub payload: TemplatePayload,
    pub scheduled_at: DateTime<Utc>,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GeneratedDocument {
    /// Pending document for the series' current cycle
    pub fn for_cycle(series: &RecurringSeries, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let (issue_date, due_date) = series.document_dates(scheduled_at);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            series_id: Some(series.id.clone()),
            sequence: series.next_sequence(),
            status: DocumentStatus::Pending,
            attempts: 1,
            amount: series.amount,
            currency: series.currency.clone(),
            payload: series.payload.clone(),
            scheduled_at,
            issue_date,
            due_date,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
