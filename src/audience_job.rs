use crate::audience::{partition, IdentitySet, PartitionInput, PartitionOutcome};
use crate::cdw::SourceWarehouse;
use crate::error::Error;
use crate::export::{copy_into_stage, write_identities};
use crate::frame::{identities_to_df, stage_distinct, TextRows};
use crate::lock::RunLock;
use crate::region::Country;
use crate::sql;
use crate::udw::{replace_table, AnalyticsWarehouse};
use crate::window::{current_day, last_45_days, PartitionRange};
use chrono::NaiveDate;
use datafusion::prelude::SessionContext;
use log::info;
use rand::Rng;
use std::path::PathBuf;

pub const DEFAULT_COUNTRIES: &str = "DE, GB";
pub const DEFAULT_TABLE_SCHEMA: &str = "udw_prod.udw_clientsolutions_cs";
pub const DEFAULT_STAGE: &str = "@UDW_PROD.UDW_CLIENTSOLUTIONS_CS.audience_planner_remote_files_udw_s";
pub const DEFAULT_FILE_FORMAT: &str = "adbiz_data.analytics_csv";

pub const DEFAULT_SEGMENT_PREFIX: &str = "230912";
pub const DEFAULT_SEGMENT_SUFFIX: &str = "alexa_register_last_45_230912to231231";
pub const DEFAULT_CONTROL_PREFIX: &str = "220601";
pub const DEFAULT_CONTROL_SUFFIX: &str = "alexa_10per_control";

const PSID_DDL: &str = "psid VARCHAR(556)";

/// Names of the exported files, `<prefix>_<country>_<suffix>.csv`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudienceFiles {
    pub segment_prefix: String,
    pub segment_suffix: String,
    pub control_prefix: String,
    pub control_suffix: String,
}

impl Default for AudienceFiles {
    fn default() -> Self {
        AudienceFiles {
            segment_prefix: DEFAULT_SEGMENT_PREFIX.to_string(),
            segment_suffix: DEFAULT_SEGMENT_SUFFIX.to_string(),
            control_prefix: DEFAULT_CONTROL_PREFIX.to_string(),
            control_suffix: DEFAULT_CONTROL_SUFFIX.to_string(),
        }
    }
}

impl AudienceFiles {
    pub fn segment_file(&self, country: &Country) -> String {
        format!("{}_{}_{}.csv", self.segment_prefix, country.lower(), self.segment_suffix)
    }

    pub fn control_file(&self, country: &Country) -> String {
        format!("{}_{}_{}.csv", self.control_prefix, country.lower(), self.control_suffix)
    }
}

#[derive(Debug, Clone)]
pub struct AudienceJob {
    pub countries: Vec<Country>,
    pub control_percent: u8,
    pub table_schema: String,
    pub stage: String,
    pub file_format: String,
    pub files: AudienceFiles,
    pub export_dir: Option<PathBuf>,
    pub lock_dir: PathBuf,
    pub today: NaiveDate,
}

/// The four UDW tables one country's audience lives in.
#[derive(Debug, Clone, PartialEq)]
pub struct AudienceTables {
    pub last_45: String,
    pub current_day: String,
    pub control: String,
    pub segment: String,
}

impl AudienceTables {
    pub fn new(schema: &str, country: &Country) -> Result<Self, Error> {
        let schema = sql::identifier(schema)?;
        let table = |name: &str| format!("{}.CDW_{}_ALEXA_{}", schema, country.as_str(), name);

        Ok(AudienceTables {
            last_45: table("LAST_45_REGISTERS"),
            current_day: table("CURRENT_DAY"),
            control: table("NEW_CONTROL"),
            segment: table("NEW_SEGMENT"),
        })
    }
}

/// Distinct psids that activated the voice assistant in `country` within `range`.
pub fn registration_query(country: &Country, range: &PartitionRange) -> String {
    format!(
        r#"
        SELECT DISTINCT psid::VARCHAR AS psid
        FROM data_kpi_src.fact_voice t
        WHERE
            partition_country = {country}
            AND category IN ('EV110')
            AND payload_exe_goal IN ('LOGIN_ACTIVATETV')
            AND payload_appid = 'com.samsung.tv.alexa-client'
            AND partition_date BETWEEN '{start}' AND '{end}';
        "#,
        country = sql::quote_literal(country.as_str()),
        start = range.start,
        end = range.end,
    )
}

async fn identity_rows(psids: &IdentitySet) -> Result<TextRows, Error> {
    let ctx = SessionContext::new();
    stage_distinct(identities_to_df(psids, &ctx)?).await
}

async fn replace_identities<U>(udw: &U, table: &str, psids: &IdentitySet) -> Result<u64, Error>
where
    U: AnalyticsWarehouse + ?Sized,
{
    replace_table(udw, table, PSID_DDL, &identity_rows(psids).await?).await
}

/// Refreshes one country's control and segment and publishes both to the stage.
///
/// The previous control is read back from UDW, so control membership only ever grows.
/// A run holds `audience_<country>.lock` in the job's lock directory throughout.
pub async fn run_country<S, U, R>(
    cdw: &mut S,
    udw: &U,
    job: &AudienceJob,
    country: &Country,
    rng: &mut R,
) -> Result<PartitionOutcome, Error>
where
    S: SourceWarehouse + ?Sized,
    U: AnalyticsWarehouse + ?Sized,
    R: Rng + ?Sized,
{
    let _lock = RunLock::acquire(&job.lock_dir, &format!("audience_{}", country.lower()))?;
    let tables = AudienceTables::new(&job.table_schema, country)?;

    info!("CDW getting {} registrations", country);
    let last_45: IdentitySet = cdw
        .fetch_identities(&registration_query(country, &last_45_days(job.today)))
        .await?
        .into_iter()
        .collect();
    let current_day: IdentitySet = cdw
        .fetch_identities(&registration_query(country, &current_day(job.today)))
        .await?
        .into_iter()
        .collect();

    info!(
        "copying {} last-45 and {} current-day registrations for {} to UDW",
        last_45.len(),
        current_day.len(),
        country
    );
    replace_identities(udw, &tables.last_45, &last_45).await?;
    replace_identities(udw, &tables.current_day, &current_day).await?;

    udw.execute(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({});",
        tables.control, PSID_DDL
    ))
    .await?;
    let previous_control: IdentitySet = udw
        .query(&format!("SELECT DISTINCT psid FROM {};", tables.control))
        .await?
        .column_values("psid")?
        .into_iter()
        .collect();

    let input = PartitionInput {
        current_day,
        last_45,
        previous_control,
    };
    let outcome = partition(&input, job.control_percent, rng);
    info!(
        "building {} audience: sampled {}, control {} (was {}), segment {}",
        country,
        outcome.sample.len(),
        outcome.new_control.len(),
        input.previous_control.len(),
        outcome.new_segment.len()
    );

    replace_identities(udw, &tables.control, &outcome.new_control).await?;
    replace_identities(udw, &tables.segment, &outcome.new_segment).await?;

    let segment_file = job.files.segment_file(country);
    let control_file = job.files.control_file(country);

    info!("saving {} audience to {}", country, job.stage);
    udw.execute(&copy_into_stage(&job.stage, &segment_file, &tables.segment, &job.file_format)?)
        .await?;
    udw.execute(&copy_into_stage(&job.stage, &control_file, &tables.control, &job.file_format)?)
        .await?;

    if let Some(dir) = &job.export_dir {
        write_identities(&dir.join(&segment_file), &outcome.new_segment)?;
        write_identities(&dir.join(&control_file), &outcome.new_control)?;
        info!("wrote {} audience files to {}", country, dir.display());
    }

    Ok(outcome)
}

/// Runs every configured country in order, stopping at the first failure.
pub async fn run<S, U, R>(cdw: &mut S, udw: &U, job: &AudienceJob, rng: &mut R) -> Result<(), Error>
where
    S: SourceWarehouse + ?Sized,
    U: AnalyticsWarehouse + ?Sized,
    R: Rng + ?Sized,
{
    for country in &job.countries {
        run_country(&mut *cdw, udw, job, country, &mut *rng).await?;
    }
    Ok(())
}
