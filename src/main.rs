mod app_usage;
mod audience;
mod audience_job;
mod cdw;
mod config;
mod error;
mod export;
mod exposures;
mod frame;
mod lock;
mod notify;
mod region;
mod reports;
mod runner;
mod sql;
mod udw;
mod window;

use app_usage::AppUsageJob;
use audience::DEFAULT_CONTROL_PERCENT;
use audience_job::{AudienceFiles, AudienceJob};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use exposures::ExposureJob;
use log::error;
use notify::{report_failure, WebhookNotifier};
use region::{parse_countries, Country, Region};
use reports::{Partner, PartnerPreset, ReportDates, ReportInterval};
use std::path::PathBuf;
use window::ReportingWindow;

#[derive(Parser)]
#[command(about = "Copies advertising data from the regional CDWs into UDW and triggers partner reports")]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Refreshes the control and segment audiences per country.
    Audience {
        #[arg(long, default_value = audience_job::DEFAULT_COUNTRIES, value_parser = validate_countries)]
        countries: Countries,

        /// Seed for the control sample. Drawn from OS entropy when unset.
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value_t = DEFAULT_CONTROL_PERCENT, value_parser = clap::value_parser!(u8).range(0..=100))]
        control_percent: u8,

        /// Also writes both CSV files into this directory.
        #[arg(long)]
        export_dir: Option<PathBuf>,

        #[arg(long, default_value = "personalAccountEU")]
        cdw_profile: String,

        #[arg(long, default_value = audience_job::DEFAULT_TABLE_SCHEMA)]
        table_schema: String,

        #[arg(long, default_value = audience_job::DEFAULT_STAGE)]
        stage: String,

        #[arg(long, default_value = audience_job::DEFAULT_FILE_FORMAT)]
        file_format: String,

        #[arg(long, default_value = audience_job::DEFAULT_SEGMENT_PREFIX)]
        segment_prefix: String,

        #[arg(long, default_value = audience_job::DEFAULT_SEGMENT_SUFFIX)]
        segment_suffix: String,

        #[arg(long, default_value = audience_job::DEFAULT_CONTROL_PREFIX)]
        control_prefix: String,

        #[arg(long, default_value = audience_job::DEFAULT_CONTROL_SUFFIX)]
        control_suffix: String,
    },

    /// Imports app usage for the last two weeks.
    AppUsage {
        #[arg(long, default_value = app_usage::DEFAULT_DESTINATION_TABLE)]
        destination_table: String,

        #[arg(long, default_value = app_usage::DEFAULT_APP_NAME)]
        app_name: String,

        /// Limits the import to these regions, e.g. `cdw_eu,cdw_sa`.
        #[arg(long, value_delimiter = ',', value_parser = validate_region)]
        regions: Vec<Region>,
    },

    /// Refreshes sales orders and imports ad exposures.
    Exposures {
        #[arg(long, default_value = exposures::DEFAULT_ADVERTISER_IDS)]
        advertiser_ids: String,

        #[arg(long, default_value = exposures::DEFAULT_SALES_ORDER_TABLE)]
        sales_order_table: String,

        #[arg(long, default_value = exposures::DEFAULT_DESTINATION_TABLE)]
        destination_table: String,

        #[arg(long, value_delimiter = ',', default_value = "cdw_eu,cdw_apac,cdw_sa", value_parser = validate_region)]
        sources: Vec<Region>,
    },

    /// Triggers the partner report procedures for every preset region.
    Reports {
        #[arg(long, value_enum)]
        partner: Partner,

        #[arg(long, value_enum, default_value_t)]
        interval: ReportInterval,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: Option<NaiveDate>,
    },
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Task::Audience { .. } => "audience",
            Task::AppUsage { .. } => "app-usage",
            Task::Exposures { .. } => "exposures",
            Task::Reports { .. } => "reports",
        }
    }
}

#[derive(Clone, Debug)]
struct Countries(Vec<Country>);

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD";

    let parts = s
        .split("-")
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

fn validate_region(s: &str) -> Result<Region, String> {
    s.parse::<Region>().map_err(|err| err.to_string())
}

fn validate_countries(s: &str) -> Result<Countries, String> {
    let countries = parse_countries(s).map_err(|err| err.to_string())?;
    if countries.is_empty() {
        return Err("expected at least one country code".to_string());
    }
    Ok(Countries(countries))
}

async fn run(config: &Config, task: Task) -> Result<(), Error> {
    let today = Local::now().date_naive();

    match task {
        Task::Audience {
            countries,
            seed,
            control_percent,
            export_dir,
            cdw_profile,
            table_schema,
            stage,
            file_format,
            segment_prefix,
            segment_suffix,
            control_prefix,
            control_suffix,
        } => {
            let job = AudienceJob {
                countries: countries.0,
                control_percent,
                table_schema,
                stage,
                file_format,
                files: AudienceFiles {
                    segment_prefix,
                    segment_suffix,
                    control_prefix,
                    control_suffix,
                },
                export_dir,
                lock_dir: config.lock_dir.clone(),
                today,
            };
            runner::run_audience(config, &job, &cdw_profile, seed).await
        }
        Task::AppUsage {
            destination_table,
            app_name,
            regions,
        } => {
            let job = AppUsageJob {
                destination_table,
                app_name,
                window: ReportingWindow::trailing_weeks(today, 2),
            };
            let regions = app_usage::region_countries(&regions)?;
            runner::run_app_usage(config, &job, &regions).await
        }
        Task::Exposures {
            advertiser_ids,
            sales_order_table,
            destination_table,
            sources,
        } => {
            let job = ExposureJob {
                advertiser_ids,
                sales_order_table,
                destination_table,
                window: ReportingWindow::trailing_months_or_quarter(today, 6),
            };
            runner::run_exposures(config, &job, &sources).await
        }
        Task::Reports {
            partner,
            interval,
            start,
            end,
        } => {
            let preset = PartnerPreset::for_partner(partner)?;
            let dates = ReportDates::new(start, end)?;
            runner::run_reports(config, &preset, interval, dates).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();

    let task = args.command.name();
    let notifier = args.config.webhook_url.as_deref().map(WebhookNotifier::new);

    if let Err(err) = run(&args.config, args.command).await {
        error!("task {} failed: {}", task, err);
        report_failure(notifier.as_ref(), task, &err).await;
        std::process::exit(1);
    }

    Ok(())
}
