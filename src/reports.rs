use crate::error::Error;
use crate::region::{parse_countries, Country, Region};
use crate::sql;
use crate::udw::AnalyticsWarehouse;
use chrono::NaiveDate;
use clap::ValueEnum;
use log::info;
use std::fmt;

const PROCEDURE_SCHEMA: &str = "udw_clientsolutions_cs";
const MAX_ROWS: u32 = 999_999;
const ATTRIBUTION_WINDOW: u32 = 7;
const ATTRIBUTION_WINDOW_DAYS: u32 = 7;
const LOOKBACK_WINDOW_MONTHS: u32 = 12;
const PAGE_VISIT_LOOKBACK_DAYS: u32 = 30;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partner {
    Pluto,
    Paramount,
}

impl Partner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partner::Pluto => "pluto",
            Partner::Paramount => "paramount",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportInterval {
    #[default]
    Weekly,
    Monthly,
}

impl fmt::Display for ReportInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportInterval::Weekly => f.write_str("weekly"),
            ReportInterval::Monthly => f.write_str("monthly"),
        }
    }
}

/// Everything the report procedures need to know about one partner.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerPreset {
    pub partner: Partner,
    pub regions: Vec<(Region, Vec<Country>)>,
    pub us_stage: &'static str,
    pub int_stage: &'static str,
    pub file_name_prefix: &'static str,
    pub operative_table: &'static str,
    pub mapping_table: &'static str,
    pub app_name: &'static str,
    pub signup_segment: &'static str,
    pub homepage_segment: &'static str,
    pub max_rows: u32,
    pub attribution_window: u32,
    pub attribution_window_days: u32,
    pub lookback_window_months: u32,
    pub page_visit_lookback_days: u32,
}

impl PartnerPreset {
    pub fn for_partner(partner: Partner) -> Result<Self, Error> {
        match partner {
            Partner::Pluto => Ok(PartnerPreset {
                partner,
                regions: regions(&[
                    (Region::UdwNa, "US, CA"),
                    (Region::CdwEu, "AT, DE, ES, FR, GB, IT"),
                    (Region::CdwNordics, "DK, NO, SE"),
                    (Region::CdwApac, "AU"),
                    (Region::CdwSa, "BR"),
                ])?,
                us_stage: "@udw_marketing_analytics_reports.pluto_external_us/pluto-us/",
                int_stage: "@udw_marketing_analytics_reports.pluto_external_international/pluto-international/",
                file_name_prefix: "pluto_",
                operative_table: "udw_prod.udw_clientsolutions_cs.pluto_operative_sales_orders",
                mapping_table: "udw_prod.udw_clientsolutions_cs.pluto_custom_creative_mapping",
                app_name: "Pluto TV",
                signup_segment: "",
                homepage_segment: "",
                ..PartnerPreset::shared(partner)
            }),
            Partner::Paramount => Ok(PartnerPreset {
                partner,
                regions: regions(&[
                    (Region::UdwNa, "US, CA"),
                    (Region::CdwEu, "AT, DE, FR, GB, IT"),
                    (Region::CdwApac, "AU"),
                    (Region::CdwSa, "BR"),
                ])?,
                us_stage: "@udw_marketing_analytics_reports.paramount_plus_external_us/paramount_plus_us/",
                int_stage:
                    "@udw_marketing_analytics_reports.paramount_plus_external_international/paramount-plus-international/",
                file_name_prefix: "paramount_plus_",
                operative_table: "udw_prod.udw_clientsolutions_cs.paramount_operative_sales_orders",
                mapping_table: "udw_prod.udw_clientsolutions_cs.paramount_custom_creative_mapping",
                app_name: "Paramount+",
                signup_segment: "52832",
                homepage_segment: "52833",
                ..PartnerPreset::shared(partner)
            }),
        }
    }

    fn shared(partner: Partner) -> Self {
        PartnerPreset {
            partner,
            regions: Vec::new(),
            us_stage: "",
            int_stage: "",
            file_name_prefix: "",
            operative_table: "",
            mapping_table: "",
            app_name: "",
            signup_segment: "",
            homepage_segment: "",
            max_rows: MAX_ROWS,
            attribution_window: ATTRIBUTION_WINDOW,
            attribution_window_days: ATTRIBUTION_WINDOW_DAYS,
            lookback_window_months: LOOKBACK_WINDOW_MONTHS,
            page_visit_lookback_days: PAGE_VISIT_LOOKBACK_DAYS,
        }
    }
}

fn regions(lists: &[(Region, &str)]) -> Result<Vec<(Region, Vec<Country>)>, Error> {
    lists
        .iter()
        .map(|(region, countries)| Ok((*region, parse_countries(countries)?)))
        .collect()
}

/// Optional report bounds. Leaving both empty lets the procedure pick the last full interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportDates {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ReportDates {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Self, Error> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(Error::StartDateAfterEndDate {
                    start_date: start.to_string(),
                    end_date: end.to_string(),
                });
            }
        }
        Ok(ReportDates { start, end })
    }
}

fn date_literal(date: Option<NaiveDate>) -> String {
    sql::quote_literal(&date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default())
}

/// The `udw_na` data already lives in UDW; every CDW region has its own procedure.
pub fn report_procedure(region: Region) -> &'static str {
    if region.is_cdw() {
        "sp_partner_get_cdw_weekly_reports"
    } else {
        "sp_partner_get_weekly_reports"
    }
}

pub fn report_call(
    preset: &PartnerPreset,
    region: Region,
    countries: &[Country],
    interval: ReportInterval,
    dates: ReportDates,
) -> Result<String, Error> {
    sql::stage_location(preset.us_stage)?;
    sql::stage_location(preset.int_stage)?;
    sql::identifier(preset.operative_table)?;
    sql::identifier(preset.mapping_table)?;

    let quote = sql::quote_literal;

    Ok(format!(
        r#"
        CALL {PROCEDURE_SCHEMA}.{procedure}(
            partner                     => {partner}
            ,region                     => {region}
            ,report_interval            => {interval}
            ,start_date                 => {start_date}
            ,end_date                   => {end_date}
            ,countries                  => {countries}
            ,max_rows                   => {max_rows}
            ,attribution_window         => {attribution_window}
            ,us_stage                   => {us_stage}
            ,int_stage                  => {int_stage}
            ,file_name_prefix           => {file_name_prefix}
            ,attribution_window_days    => {attribution_window_days}
            ,lookback_window_months     => {lookback_window_months}
            ,page_visit_lookback_days   => {page_visit_lookback_days}
            ,operative_table            => {operative_table}
            ,mapping_table              => {mapping_table}
            ,app_name                   => {app_name}
            ,signup_segment             => {signup_segment}
            ,homepage_segment           => {homepage_segment}
        );
        "#,
        procedure = report_procedure(region),
        partner = quote(preset.partner.as_str()),
        region = quote(region.as_str()),
        interval = quote(&interval.to_string()),
        start_date = date_literal(dates.start),
        end_date = date_literal(dates.end),
        countries = quote(&crate::region::join_countries(countries)),
        max_rows = preset.max_rows,
        attribution_window = preset.attribution_window,
        us_stage = quote(preset.us_stage),
        int_stage = quote(preset.int_stage),
        file_name_prefix = quote(preset.file_name_prefix),
        attribution_window_days = preset.attribution_window_days,
        lookback_window_months = preset.lookback_window_months,
        page_visit_lookback_days = preset.page_visit_lookback_days,
        operative_table = quote(preset.operative_table),
        mapping_table = quote(preset.mapping_table),
        app_name = quote(preset.app_name),
        signup_segment = quote(preset.signup_segment),
        homepage_segment = quote(preset.homepage_segment),
    ))
}

/// Calls the report procedure once per preset region, in order, stopping at the first failure.
///
/// # Returns
/// The number of regions whose reports were triggered.
pub async fn trigger_reports<U>(
    udw: &U,
    preset: &PartnerPreset,
    interval: ReportInterval,
    dates: ReportDates,
) -> Result<usize, Error>
where
    U: AnalyticsWarehouse + ?Sized,
{
    for (region, countries) in &preset.regions {
        let call = report_call(preset, *region, countries, interval, dates)?;
        info!(
            "UDW triggering {} {} reports for {}",
            preset.partner.as_str(),
            interval,
            region
        );
        udw.execute(&call).await?;
    }

    Ok(preset.regions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udw::MockAnalyticsWarehouse;
    use mockall::Sequence;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_presets() {
        let pluto = PartnerPreset::for_partner(Partner::Pluto).unwrap();
        assert_eq!(pluto.regions.len(), 5);
        assert_eq!(pluto.regions[1].0, Region::CdwEu);
        assert_eq!(pluto.regions[1].1.len(), 6);
        assert_eq!(pluto.max_rows, 999_999);
        assert_eq!(pluto.page_visit_lookback_days, 30);

        let paramount = PartnerPreset::for_partner(Partner::Paramount).unwrap();
        assert!(paramount.regions.iter().all(|(region, _)| *region != Region::CdwNordics));
        assert_eq!(paramount.signup_segment, "52832");
        assert_eq!(paramount.homepage_segment, "52833");
        assert_eq!(paramount.lookback_window_months, 12);
    }

    #[test]
    fn test_report_procedure_by_region() {
        assert_eq!(report_procedure(Region::UdwNa), "sp_partner_get_weekly_reports");
        assert_eq!(report_procedure(Region::CdwNordics), "sp_partner_get_cdw_weekly_reports");
    }

    #[test]
    fn test_report_call_arguments() {
        let preset = PartnerPreset::for_partner(Partner::Pluto).unwrap();
        let (region, countries) = &preset.regions[0];
        let call = report_call(&preset, *region, countries, ReportInterval::Weekly, ReportDates::default()).unwrap();

        assert!(call.contains("CALL udw_clientsolutions_cs.sp_partner_get_weekly_reports("));
        assert!(call.contains("partner                     => 'pluto'"));
        assert!(call.contains(",region                     => 'udw_na'"));
        assert!(call.contains(",report_interval            => 'weekly'"));
        assert!(call.contains(",start_date                 => ''"));
        assert!(call.contains(",countries                  => 'US, CA'"));
        assert!(call.contains(",max_rows                   => 999999"));
        assert!(call.contains(",app_name                   => 'Pluto TV'"));
    }

    #[test]
    fn test_report_call_with_dates() {
        let preset = PartnerPreset::for_partner(Partner::Paramount).unwrap();
        let dates = ReportDates::new(Some(date("2024-04-01")), Some(date("2024-04-30"))).unwrap();
        let countries = parse_countries("AU").unwrap();
        let call = report_call(&preset, Region::CdwApac, &countries, ReportInterval::Monthly, dates).unwrap();

        assert!(call.contains("CALL udw_clientsolutions_cs.sp_partner_get_cdw_weekly_reports("));
        assert!(call.contains(",report_interval            => 'monthly'"));
        assert!(call.contains(",start_date                 => '2024-04-01'"));
        assert!(call.contains(",end_date                   => '2024-04-30'"));
        assert!(call.contains(",app_name                   => 'Paramount+'"));
    }

    #[test]
    fn test_report_dates_in_wrong_order() {
        let result = ReportDates::new(Some(date("2024-05-01")), Some(date("2024-04-01")));
        assert!(matches!(result.unwrap_err(), Error::StartDateAfterEndDate { .. }));

        assert!(ReportDates::new(Some(date("2024-05-01")), None).is_ok());
    }

    #[tokio::test]
    async fn test_trigger_reports_calls_each_region() {
        let preset = PartnerPreset::for_partner(Partner::Pluto).unwrap();
        let mut seq = Sequence::new();
        let mut udw = MockAnalyticsWarehouse::new();

        for (region, _) in preset.regions.clone() {
            udw.expect_execute()
                .withf(move |sql: &str| sql.contains(&format!("region                     => '{}'", region)))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        let triggered = trigger_reports(&udw, &preset, ReportInterval::Weekly, ReportDates::default())
            .await
            .unwrap();
        assert_eq!(triggered, 5);
    }

    #[tokio::test]
    async fn test_trigger_reports_stops_at_first_failure() {
        let preset = PartnerPreset::for_partner(Partner::Paramount).unwrap();
        let mut udw = MockAnalyticsWarehouse::new();
        udw.expect_execute().times(1).returning(|_| {
            Err(Error::Statement {
                code: "002003".to_string(),
                message: "procedure does not exist".to_string(),
            })
        });

        let result = trigger_reports(&udw, &preset, ReportInterval::Weekly, ReportDates::default()).await;
        assert!(matches!(result.unwrap_err(), Error::Statement { .. }));
    }
}
