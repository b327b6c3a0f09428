use crate::cdw::SourceWarehouse;
use crate::error::Error;
use crate::frame::{app_usage_to_df, stage_distinct};
use crate::region::{join_countries, parse_countries, Country, Region};
use crate::sql;
use crate::udw::{merge_new_rows, AnalyticsWarehouse};
use crate::window::ReportingWindow;
use datafusion::prelude::SessionContext;
use log::{info, warn};

pub const APP_USAGE_COLUMNS: [&str; 7] = [
    "tifa",
    "app_usage_datetime",
    "country",
    "app_id",
    "time_spent_min",
    "usage_count",
    "date_imported",
];

/// A row counts as already imported when all of these match.
pub const APP_USAGE_KEY: [&str; 5] = [
    "tifa",
    "app_usage_datetime",
    "country",
    "app_id",
    "time_spent_min",
];

const PREP_COLUMNS_DDL: &str = "tifa VARCHAR, app_usage_datetime TIMESTAMP, country VARCHAR, \
     app_id VARCHAR, time_spent_min BIGINT, usage_count INT, date_imported DATE";

pub const DEFAULT_DESTINATION_TABLE: &str = "udw_clientsolutions_cs.pluto_custom_app_usage";
pub const DEFAULT_APP_NAME: &str = "Pluto TV";

/// Countries imported per CDW region unless the caller narrows the list.
pub const DEFAULT_REGION_COUNTRIES: [(Region, &str); 4] = [
    (Region::CdwEu, "AT, DE, ES, FR, GB, IT"),
    (Region::CdwNordics, "DK, NO, SE"),
    (Region::CdwApac, "AU"),
    (Region::CdwSa, "BR"),
];

/// The default region list, keeping only `selected` when it is not empty.
pub fn region_countries(selected: &[Region]) -> Result<Vec<(Region, Vec<Country>)>, Error> {
    DEFAULT_REGION_COUNTRIES
        .iter()
        .filter(|(region, _)| selected.is_empty() || selected.contains(region))
        .map(|(region, countries)| Ok((*region, parse_countries(countries)?)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct AppUsageJob {
    pub destination_table: String,
    pub app_name: String,
    pub window: ReportingWindow,
}

/// Builds the CDW query for one region. Nordics devices report app opens only,
/// so time spent is always 0 there.
pub fn app_usage_query(
    region: Region,
    countries: &[Country],
    app_name: &str,
    window: &ReportingWindow,
) -> Result<String, Error> {
    let app_name = sql::quote_literal(app_name);
    let countries = sql::country_list(countries);

    match region {
        Region::CdwEu | Region::CdwApac | Region::CdwSa => Ok(format!(
            r#"
            SELECT
                psid_tvid(f.psid)::VARCHAR AS tifa
                ,f.start_timestamp::TIMESTAMP AS app_usage_datetime
                ,f.country::VARCHAR AS country
                ,f.app_id::VARCHAR AS app_id
                ,SUM(DATEDIFF('minutes', f.start_timestamp, f.end_timestamp))::BIGINT AS time_spent_min
                ,COUNT(*)::BIGINT AS usage_count
                ,CURRENT_DATE::DATE AS date_imported
            FROM data_tv_acr.fact_app_usage_session f
            WHERE
                f.app_id IN (
                    SELECT DISTINCT app_id
                    FROM meta_apps.meta_taps_sra_app_lang_l
                    WHERE prod_nm = {app_name}
                )
                AND f.country IN {countries}
                AND DATEDIFF('second', f.start_timestamp, f.end_timestamp) >= 60
                AND f.partition_datehour BETWEEN '{start}00' AND '{end}23'
            GROUP BY 1, 2, 3, 4, 7;
            "#,
            start = window.start_partition_day(),
            end = window.end_partition_day(),
        )),
        Region::CdwNordics => Ok(format!(
            r#"
            SELECT
                psid_tvid(f.psid)::VARCHAR AS tifa
                ,f.event_time::TIMESTAMP AS app_usage_datetime
                ,f.country::VARCHAR AS country
                ,f.app_id::VARCHAR AS app_id
                ,0::BIGINT AS time_spent_min
                ,COUNT(*)::BIGINT AS usage_count
                ,CURRENT_DATE::DATE AS date_imported
            FROM data_tv_smarthub.fact_app_opened_event f
            WHERE
                f.app_id IN (
                    SELECT DISTINCT app_id::VARCHAR
                    FROM meta_apps.meta_taps_sra_app_lang_l
                    WHERE prod_nm = {app_name}
                )
                AND f.country IN {countries}
                AND f.partition_date BETWEEN '{start}' AND '{end}'
            GROUP BY 1, 2, 3, 4, 7;
            "#,
            start = window.start_partition_day(),
            end = window.end_partition_day(),
        )),
        Region::UdwNa => Err(Error::InvalidRegion {
            region: region.to_string(),
        }),
    }
}

/// Copies one region's app usage into the destination table, skipping rows already there.
///
/// # Returns
/// The number of distinct rows staged. An empty region is logged and yields 0.
pub async fn import_region<S, U>(
    cdw: &mut S,
    udw: &U,
    job: &AppUsageJob,
    region: Region,
    countries: &[Country],
) -> Result<u64, Error>
where
    S: SourceWarehouse + ?Sized,
    U: AnalyticsWarehouse + ?Sized,
{
    let query = app_usage_query(region, countries, &job.app_name, &job.window)?;

    info!(
        "CDW getting {} app usage for {} ({})",
        job.app_name,
        region,
        join_countries(countries)
    );
    let records = cdw.fetch_app_usage(&query).await?;

    let ctx = SessionContext::new();
    let rows = stage_distinct(app_usage_to_df(&records, &ctx)?).await?;
    if rows.is_empty() {
        warn!("no app usage to update for {}", region);
        return Ok(0);
    }

    let prep_table = format!("APP_PREP_{}", region.as_str().to_ascii_uppercase());
    let merge_sql = sql::insert_missing(
        &job.destination_table,
        &prep_table,
        &APP_USAGE_COLUMNS,
        &APP_USAGE_KEY,
    )?;

    let loaded = merge_new_rows(udw, &prep_table, PREP_COLUMNS_DDL, &rows, &merge_sql).await?;
    info!("{} app usage rows from {} merged into {}", loaded, region, job.destination_table);

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdw::{AppUsageRecord, MockSourceWarehouse};
    use crate::frame::TextRows;
    use crate::udw::MockAnalyticsWarehouse;
    use chrono::NaiveDate;

    fn job() -> AppUsageJob {
        AppUsageJob {
            destination_table: DEFAULT_DESTINATION_TABLE.to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            window: ReportingWindow::trailing_weeks(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap(), 2),
        }
    }

    fn record(tifa: &str) -> AppUsageRecord {
        AppUsageRecord {
            tifa: tifa.to_string(),
            app_usage_datetime: NaiveDate::from_ymd_opt(2024, 5, 2)
                .unwrap()
                .and_hms_opt(8, 30, 0)
                .unwrap(),
            country: "DE".to_string(),
            app_id: "3201808016802".to_string(),
            time_spent_min: 42,
            usage_count: 3,
            date_imported: NaiveDate::from_ymd_opt(2024, 5, 15).unwrap(),
        }
    }

    #[test]
    fn test_region_countries_filter() {
        let all = region_countries(&[]).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].1.len(), 3);

        let nordics = region_countries(&[Region::CdwNordics]).unwrap();
        assert_eq!(nordics, vec![(Region::CdwNordics, parse_countries("DK, NO, SE").unwrap())]);
    }

    #[test]
    fn test_acr_query_for_eu() {
        let countries = parse_countries("AT, DE").unwrap();
        let query = app_usage_query(Region::CdwEu, &countries, "Pluto TV", &job().window).unwrap();

        assert!(query.contains("FROM data_tv_acr.fact_app_usage_session f"));
        assert!(query.contains("WHERE prod_nm = 'Pluto TV'"));
        assert!(query.contains("AND f.country IN ('AT', 'DE')"));
        assert!(query.contains("BETWEEN '2024050100' AND '2024051423'"));
        assert!(query.contains(">= 60"));
    }

    #[test]
    fn test_nordics_query_uses_app_open_events() {
        let countries = parse_countries("DK, NO, SE").unwrap();
        let query = app_usage_query(Region::CdwNordics, &countries, "Pluto TV", &job().window).unwrap();

        assert!(query.contains("FROM data_tv_smarthub.fact_app_opened_event f"));
        assert!(query.contains("0::BIGINT AS time_spent_min"));
        assert!(query.contains("BETWEEN '20240501' AND '20240514'"));
    }

    #[test]
    fn test_query_rejects_na_region() {
        let result = app_usage_query(Region::UdwNa, &[], "Pluto TV", &job().window);
        assert!(matches!(result.unwrap_err(), Error::InvalidRegion { region } if region == "udw_na"));
    }

    #[tokio::test]
    async fn test_import_region_merges_distinct_rows() {
        let mut cdw = MockSourceWarehouse::new();
        cdw.expect_fetch_app_usage()
            .times(1)
            .returning(|_| Ok(vec![record("t1"), record("t1"), record("t2")]));

        let mut udw = MockAnalyticsWarehouse::new();
        udw.expect_execute()
            .withf(|sql: &str| sql.starts_with("CREATE OR REPLACE TRANSIENT TABLE APP_PREP_CDW_EU"))
            .times(1)
            .returning(|_| Ok(()));
        udw.expect_bulk_insert()
            .withf(|table: &str, rows: &TextRows| {
                table == "APP_PREP_CDW_EU" && rows.len() == 2 && rows.columns == APP_USAGE_COLUMNS
            })
            .times(1)
            .returning(|_, rows| Ok(rows.len() as u64));
        udw.expect_execute()
            .withf(|sql: &str| {
                sql.contains("INSERT INTO udw_clientsolutions_cs.pluto_custom_app_usage")
                    && sql.contains("old_data.time_spent_min = new_data.time_spent_min")
                    && !sql.contains("old_data.usage_count")
            })
            .times(1)
            .returning(|_| Ok(()));
        udw.expect_execute()
            .withf(|sql: &str| sql.starts_with("DROP TABLE IF EXISTS APP_PREP_CDW_EU"))
            .times(1)
            .returning(|_| Ok(()));

        let countries = parse_countries("DE").unwrap();
        let loaded = import_region(&mut cdw, &udw, &job(), Region::CdwEu, &countries)
            .await
            .unwrap();
        assert_eq!(loaded, 2);
    }

    #[tokio::test]
    async fn test_import_region_without_rows_skips_load() {
        let mut cdw = MockSourceWarehouse::new();
        cdw.expect_fetch_app_usage().times(1).returning(|_| Ok(vec![]));

        let mut udw = MockAnalyticsWarehouse::new();
        udw.expect_execute().never();
        udw.expect_bulk_insert().never();

        let countries = parse_countries("AU").unwrap();
        let loaded = import_region(&mut cdw, &udw, &job(), Region::CdwApac, &countries)
            .await
            .unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_import_region_propagates_cdw_failure() {
        let mut cdw = MockSourceWarehouse::new();
        cdw.expect_fetch_app_usage()
            .times(1)
            .returning(|_| Err(Error::Cdw(sqlx::Error::RowNotFound)));
        let udw = MockAnalyticsWarehouse::new();

        let countries = parse_countries("BR").unwrap();
        let result = import_region(&mut cdw, &udw, &job(), Region::CdwSa, &countries).await;
        assert!(matches!(result.unwrap_err(), Error::Cdw(_)));
    }
}
