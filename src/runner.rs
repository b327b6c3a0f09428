use crate::app_usage::{self, AppUsageJob};
use crate::audience::run_rng;
use crate::audience_job::{self, AudienceJob};
use crate::cdw::{CdwClient, SourceWarehouse};
use crate::config::{Config, Profiles};
use crate::error::Error;
use crate::exposures::{self, ExposureJob};
use crate::region::{Country, Region};
use crate::reports::{self, PartnerPreset, ReportDates, ReportInterval};
use crate::udw::SnowflakeClient;
use log::info;
use std::time::Instant;

/// Closes the CDW session whatever `result` holds. The job's own error wins over a close failure.
pub async fn close_after<S, T>(cdw: &mut S, result: Result<T, Error>) -> Result<T, Error>
where
    S: SourceWarehouse + ?Sized,
{
    let closed = cdw.close().await;
    let value = result?;
    closed?;
    Ok(value)
}

fn load_profiles(config: &Config) -> Result<Profiles, Error> {
    let profiles = Profiles::load(&config.config_file)?;
    info!("loaded profiles from {}", config.config_file.display());
    Ok(profiles)
}

fn udw_client(config: &Config, profiles: &Profiles) -> Result<SnowflakeClient, Error> {
    let profile = profiles.udw(&config.udw_profile)?;
    Ok(SnowflakeClient::new(profile, config.statement_timeout_secs))
}

fn log_running_time(task: &str, started: Instant) {
    info!("task {} done in {}s", task, started.elapsed().as_secs());
}

pub async fn run_audience(
    config: &Config,
    job: &AudienceJob,
    cdw_profile: &str,
    seed: Option<u64>,
) -> Result<(), Error> {
    let started = Instant::now();
    let profiles = load_profiles(config)?;
    let cdw_profile = profiles.cdw(cdw_profile)?;
    let udw = udw_client(config, &profiles)?;
    let mut rng = run_rng(seed);

    let mut cdw = CdwClient::connect(cdw_profile).await?;
    let result = audience_job::run(&mut cdw, &udw, job, &mut rng).await;
    close_after(&mut cdw, result).await?;

    log_running_time("audience", started);
    Ok(())
}

pub async fn run_app_usage(
    config: &Config,
    job: &AppUsageJob,
    regions: &[(Region, Vec<Country>)],
) -> Result<(), Error> {
    let started = Instant::now();
    let profiles = load_profiles(config)?;
    // resolve every profile before the first connection opens
    let sources = regions
        .iter()
        .map(|(region, countries)| Ok((*region, countries, profiles.cdw_for_region(*region)?)))
        .collect::<Result<Vec<_>, Error>>()?;
    let udw = udw_client(config, &profiles)?;

    for (region, countries, profile) in sources {
        let mut cdw = CdwClient::connect(profile).await?;
        let result = app_usage::import_region(&mut cdw, &udw, job, region, countries).await;
        close_after(&mut cdw, result).await?;
    }

    log_running_time("app-usage", started);
    Ok(())
}

pub async fn run_exposures(config: &Config, job: &ExposureJob, sources: &[Region]) -> Result<(), Error> {
    let started = Instant::now();
    let profiles = load_profiles(config)?;
    let sources = sources
        .iter()
        .map(|region| Ok((*region, profiles.cdw_for_region(*region)?)))
        .collect::<Result<Vec<_>, Error>>()?;
    let udw = udw_client(config, &profiles)?;

    exposures::refresh_sales_orders(&udw, job).await?;

    for (region, profile) in sources {
        let mut cdw = CdwClient::connect(profile).await?;
        let result = exposures::import_source(&mut cdw, &udw, job, region.as_str()).await;
        close_after(&mut cdw, result).await?;
    }

    log_running_time("exposures", started);
    Ok(())
}

pub async fn run_reports(
    config: &Config,
    preset: &PartnerPreset,
    interval: ReportInterval,
    dates: ReportDates,
) -> Result<(), Error> {
    let started = Instant::now();
    let profiles = load_profiles(config)?;
    let udw = udw_client(config, &profiles)?;

    let triggered = reports::trigger_reports(&udw, preset, interval, dates).await?;
    info!("triggered reports for {} regions", triggered);

    log_running_time("reports", started);
    Ok(())
}
