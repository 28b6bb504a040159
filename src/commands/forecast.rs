use anyhow::{Context, Result};
use chrono::Utc;

use recur::config::Config;
use recur::models::SeriesStatus;
use recur::scheduler::project_forecast;
use recur::storage::{open_repository, SeriesFilter};

pub fn forecast(config: Config, months: u32, json: bool) -> Result<()> {
    let repo = open_repository(&config.database).context("Failed to open series database")?;
    let active = repo.list_series(&SeriesFilter::with_status(SeriesStatus::Active))?;

    let forecast = project_forecast(&active, Utc::now(), months)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&forecast)?);
    } else {
        print!("{}", forecast.display());
    }
    Ok(())
}
