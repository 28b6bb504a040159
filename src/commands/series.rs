use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use std::path::{Path, PathBuf};

use recur::config::Config;
use recur::models::{
    EndCondition, EndType, Frequency, RecurringSeries, SeriesDraft, SeriesPatch, SeriesStatus,
    TemplatePayload,
};
use recur::scheduler::LifecycleManager;
use recur::storage::{open_repository, SeriesFilter};

/// Arguments for `recur create`
#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Owning team
    #[arg(long)]
    pub team: String,

    /// Creating user
    #[arg(long)]
    pub user: String,

    /// weekly, biweekly, monthly_date, monthly_weekday, monthly_last_day,
    /// quarterly, semi_annual, annual or custom
    #[arg(short, long)]
    pub frequency: Frequency,

    /// Weekday (0 = Sunday) or day of month, depending on frequency
    #[arg(long)]
    pub day: Option<u32>,

    /// Week of month (1-4) for monthly_weekday
    #[arg(long)]
    pub week: Option<u32>,

    /// Days between documents for custom
    #[arg(long)]
    pub interval: Option<u32>,

    /// IANA timezone
    #[arg(long, default_value = "UTC")]
    pub timezone: String,

    /// Days between issue and due date
    #[arg(long)]
    pub due_date_offset: Option<u32>,

    #[arg(long)]
    pub customer_id: Option<String>,

    #[arg(long)]
    pub customer_name: Option<String>,

    /// Stop after this instant (RFC 3339)
    #[arg(long, conflicts_with = "end_count")]
    pub end_date: Option<DateTime<Utc>>,

    /// Stop after this many documents
    #[arg(long)]
    pub end_count: Option<u32>,

    #[arg(long)]
    pub amount: Option<f64>,

    #[arg(long)]
    pub currency: Option<String>,

    /// JSON file with line items and template data
    #[arg(long)]
    pub payload: Option<PathBuf>,

    /// Issue date of the first document (RFC 3339); defaults to now
    #[arg(long)]
    pub issue_date: Option<DateTime<Utc>>,
}

/// Arguments for `recur update`
#[derive(Debug, Args)]
pub struct UpdateArgs {
    /// Series ID
    pub id: String,

    #[arg(long)]
    pub customer_name: Option<String>,

    #[arg(short, long)]
    pub frequency: Option<Frequency>,

    #[arg(long)]
    pub day: Option<u32>,

    #[arg(long)]
    pub week: Option<u32>,

    #[arg(long)]
    pub interval: Option<u32>,

    #[arg(long)]
    pub timezone: Option<String>,

    #[arg(long)]
    pub due_date_offset: Option<u32>,

    /// never, on_date or after_count
    #[arg(long)]
    pub end_type: Option<EndType>,

    #[arg(long)]
    pub end_date: Option<DateTime<Utc>>,

    #[arg(long)]
    pub end_count: Option<u32>,

    #[arg(long)]
    pub amount: Option<f64>,

    #[arg(long)]
    pub currency: Option<String>,

    /// JSON file replacing the template payload
    #[arg(long)]
    pub payload: Option<PathBuf>,
}

fn manager(config: &Config) -> Result<LifecycleManager> {
    let repo = open_repository(&config.database).context("Failed to open series database")?;
    Ok(LifecycleManager::new(repo))
}

fn read_payload(path: &Path) -> Result<TemplatePayload> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse payload file: {}", path.display()))
}

fn format_instant(instant: Option<DateTime<Utc>>) -> String {
    instant
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_series(series: &RecurringSeries) {
    println!("ID:            {}", series.id);
    println!("Team:          {}", series.team_id);
    if let Some(name) = &series.customer_name {
        println!("Customer:      {name}");
    }
    println!("Schedule:      {}", series.describe_schedule());
    println!("Timezone:      {}", series.timezone);
    println!("Status:        {}", series.status);
    println!("Generated:     {}", series.invoices_generated);
    match series.end_type {
        EndType::Never => println!("Ends:          never"),
        EndType::OnDate => println!("Ends:          {}", format_instant(series.end_date)),
        EndType::AfterCount => println!(
            "Ends:          after {} documents",
            series.end_count.unwrap_or_default()
        ),
    }
    if let Some(amount) = series.amount {
        println!(
            "Amount:        {amount:.2} {}",
            series.currency.as_deref().unwrap_or("")
        );
    }
    println!("Next:          {}", format_instant(series.next_scheduled_at));
    println!("Last:          {}", format_instant(series.last_generated_at));
    if series.consecutive_failures > 0 {
        println!("Failures:      {}", series.consecutive_failures);
    }
}

pub fn create(config: Config, args: CreateArgs) -> Result<()> {
    let mut draft = SeriesDraft::new(args.team, args.user, args.frequency).timezone(args.timezone);
    draft.frequency_day = args.day;
    draft.frequency_week = args.week;
    draft.frequency_interval = args.interval;
    draft.due_date_offset = args.due_date_offset;
    draft.customer_id = args.customer_id;
    draft.customer_name = args.customer_name;
    draft.amount = args.amount;
    draft.currency = args.currency;
    draft.issue_date = args.issue_date;

    draft = match (args.end_date, args.end_count) {
        (Some(date), None) => draft.ending(EndCondition::on_date(date)),
        (None, Some(count)) => draft.ending(EndCondition::after_count(count)),
        (None, None) => draft,
        (Some(_), Some(_)) => bail!("--end-date and --end-count cannot be combined"),
    };

    if let Some(path) = &args.payload {
        draft.payload = read_payload(path)?;
    }

    let series = manager(&config)?.create(draft, Utc::now())?;

    println!("Created recurring series");
    println!("========================");
    print_series(&series);
    Ok(())
}

pub fn update(config: Config, args: UpdateArgs) -> Result<()> {
    let payload = args.payload.as_deref().map(read_payload).transpose()?;

    let patch = SeriesPatch {
        customer_name: args.customer_name,
        frequency: args.frequency,
        frequency_day: args.day,
        frequency_week: args.week,
        frequency_interval: args.interval,
        timezone: args.timezone,
        due_date_offset: args.due_date_offset,
        end_type: args.end_type,
        end_date: args.end_date,
        end_count: args.end_count,
        amount: args.amount,
        currency: args.currency,
        payload,
    };

    if patch == SeriesPatch::default() {
        bail!("Nothing to update");
    }

    let series = manager(&config)?.update(&args.id, &patch, Utc::now())?;

    println!("Updated recurring series");
    println!("========================");
    print_series(&series);
    Ok(())
}

pub fn list(
    config: Config,
    status: Option<SeriesStatus>,
    team: Option<String>,
    limit: usize,
) -> Result<()> {
    let filter = SeriesFilter {
        status,
        team_id: team,
        limit: Some(limit),
        offset: 0,
    };
    let series = manager(&config)?.list(&filter)?;

    println!("Recurring Series ({})", series.len());
    println!("================================");
    for s in &series {
        println!(
            "{}  {:<9}  {:<40}  next: {}",
            s.id,
            s.status.as_str(),
            s.describe_schedule(),
            format_instant(s.next_scheduled_at)
        );
    }
    Ok(())
}

pub fn show(config: Config, id: &str) -> Result<()> {
    let repo = open_repository(&config.database).context("Failed to open series database")?;
    let series = LifecycleManager::new(repo.clone()).get(id)?;
    let documents = repo.documents_for_series(id)?;

    println!("Recurring Series");
    println!("================");
    print_series(&series);

    println!("\nDocuments ({})", documents.len());
    println!("----------------");
    for doc in &documents {
        println!(
            "#{:<4} {:<9} issue {}  due {}{}",
            doc.sequence,
            doc.status.as_str(),
            doc.issue_date.format("%Y-%m-%d"),
            doc.due_date.format("%Y-%m-%d"),
            doc.last_error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn document(config: Config, id: &str) -> Result<()> {
    match manager(&config)?.document_info(id)? {
        Some(info) => {
            println!("Document {id}");
            println!("Series:    {}", info.series_id);
            println!("Position:  {}", info.position());
            println!("Schedule:  {}", info.frequency);
            println!("Status:    {}", info.status);
            println!("Next:      {}", format_instant(info.next_scheduled_at));
        }
        None => println!("Document {id} is not part of a recurring series"),
    }
    Ok(())
}

pub fn pause(config: Config, id: &str) -> Result<()> {
    let series = manager(&config)?.pause(id, Utc::now())?;
    println!("Paused {} ({})", series.id, series.describe_schedule());
    Ok(())
}

pub fn resume(config: Config, id: &str) -> Result<()> {
    let series = manager(&config)?.resume(id, Utc::now())?;
    match series.status {
        SeriesStatus::Completed => println!("Series {} has already reached its end", series.id),
        _ => println!(
            "Resumed {}; next document {}",
            series.id,
            format_instant(series.next_scheduled_at)
        ),
    }
    Ok(())
}

pub fn cancel(config: Config, id: &str) -> Result<()> {
    let series = manager(&config)?.cancel(id, Utc::now())?;
    println!("Canceled {}", series.id);
    Ok(())
}

pub fn upcoming(config: Config, id: &str, limit: Option<usize>) -> Result<()> {
    let schedule = manager(&config)?.upcoming(id, limit, Utc::now())?;

    println!("Upcoming Documents");
    println!("==================");
    for (i, occurrence) in schedule.occurrences.iter().enumerate() {
        println!(
            "{:>3}. {}  {:>12.2} {}",
            i + 1,
            occurrence.date.format("%Y-%m-%d %H:%M UTC"),
            occurrence.amount,
            schedule.summary.currency
        );
    }

    let summary = &schedule.summary;
    match (summary.total_count, summary.total_amount) {
        (Some(count), Some(total)) => println!(
            "\nRemaining: {count} documents, {total:.2} {}",
            summary.currency
        ),
        _ => println!("\nNo end condition; series continues indefinitely"),
    }
    Ok(())
}
