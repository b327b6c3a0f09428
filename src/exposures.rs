use crate::cdw::{CampaignMapping, SourceWarehouse};
use crate::error::Error;
use crate::frame::{exposures_to_df, stage_distinct, TextRows};
use crate::sql;
use crate::udw::{merge_new_rows, AnalyticsWarehouse};
use crate::window::ReportingWindow;
use datafusion::prelude::SessionContext;
use log::{info, warn};

pub const DEFAULT_ADVERTISER_IDS: &str = "13191, 13190";
pub const DEFAULT_SALES_ORDER_TABLE: &str = "udw_clientsolutions_cs.pluto_operative_sales_orders";
pub const DEFAULT_DESTINATION_TABLE: &str = "udw_clientsolutions_cs.pluto_custom_global_exposure";

pub const EXPOSURE_COLUMNS: [&str; 6] = [
    "vao",
    "device_country",
    "campaign_id",
    "flight_id",
    "creative_id",
    "event_datehour_utc",
];

const MAP_TABLE: &str = "map_prep";

const PREP_COLUMNS_DDL: &str = "vao BIGINT, device_country VARCHAR(8), campaign_id BIGINT, \
     flight_id BIGINT, creative_id BIGINT, event_datehour_utc TIMESTAMP";

#[derive(Debug, Clone)]
pub struct ExposureJob {
    pub advertiser_ids: String,
    pub sales_order_table: String,
    pub destination_table: String,
    pub window: ReportingWindow,
}

/// Rebuilds the operative sales-order table for the job's advertisers.
pub async fn refresh_sales_orders<U>(udw: &U, job: &ExposureJob) -> Result<(), Error>
where
    U: AnalyticsWarehouse + ?Sized,
{
    let statement = format!(
        r#"
        CALL udw_clientsolutions_cs.sp_update_custom_operative_sales_orders(
            advertiser_ids => {}
            ,destination_table => {}
        );
        "#,
        sql::quote_literal(&job.advertiser_ids),
        sql::quote_literal(sql::identifier(&job.sales_order_table)?),
    );

    info!("UDW refreshing {}", job.sales_order_table);
    udw.execute(&statement).await
}

/// Non-archived campaigns whose sales-order line items overlap the window.
pub fn campaign_map_query(sales_order_table: &str, window: &ReportingWindow) -> Result<String, Error> {
    let sales_order_table = sql::identifier(sales_order_table)?;

    Ok(format!(
        r#"
        WITH cmpgn AS (
            SELECT DISTINCT
                oms_att.sales_order_id
                ,cmpgn.id AS campaign_id
                ,oms_att.package_sales_order_line_item_id
            FROM trader.campaigns_latest AS cmpgn
                JOIN (
                    SELECT DISTINCT
                        cmpgn_att.campaign_id
                        ,cmpgn_att.io_external_id AS sales_order_id
                        ,cmpgn_att.li_external_id AS package_sales_order_line_item_id
                    FROM trader.campaign_oms_attrs_latest AS cmpgn_att
                ) AS oms_att ON cmpgn.id = oms_att.campaign_id
            WHERE cmpgn.state != 'archived'
        )
        SELECT DISTINCT
            so.vao
            ,c.campaign_id
        FROM {sales_order_table} so
            JOIN cmpgn c ON c.package_sales_order_line_item_id = so.package_sales_order_line_item_id
        WHERE
            so.vao IS NOT NULL
            AND so.sales_order_name IS NOT NULL
            AND so.sales_order_name != ''
            AND c.campaign_id IS NOT NULL
            AND so.package_sales_order_line_item_end_at >= '{start}'::TIMESTAMP
            AND so.package_sales_order_line_item_start_at <= '{end}'::TIMESTAMP;
        "#,
        start = window.start_literal(),
        end = window.end_literal(),
    ))
}

/// Reads `(vao, campaign_id)` pairs out of a UDW result. Rows with a null in either column are skipped.
pub fn parse_campaign_map(rows: &TextRows) -> Result<Vec<CampaignMapping>, Error> {
    let position = |name: &str| {
        rows.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnexpectedResponse {
                message: format!("campaign map has no column '{}'", name),
            })
    };
    let vao_index = position("vao")?;
    let campaign_index = position("campaign_id")?;

    let parse = |value: &str| {
        value.trim().parse::<i64>().map_err(|_| Error::UnexpectedResponse {
            message: format!("campaign map value '{}' is not an integer", value),
        })
    };

    let mut mappings = Vec::with_capacity(rows.len());
    for row in &rows.values {
        if let (Some(Some(vao)), Some(Some(campaign_id))) = (row.get(vao_index), row.get(campaign_index)) {
            mappings.push(CampaignMapping {
                vao: parse(vao)?,
                campaign_id: parse(campaign_id)?,
            });
        }
    }

    Ok(mappings)
}

pub fn exposure_query(window: &ReportingWindow) -> String {
    format!(
        r#"
        SELECT DISTINCT
            m.vao::BIGINT AS vao
            ,f.device_country::VARCHAR AS device_country
            ,f.campaign_id::BIGINT AS campaign_id
            ,f.flight_id::BIGINT AS flight_id
            ,f.creative_id::BIGINT AS creative_id
            ,DATE_TRUNC('hour', f.event_time)::TIMESTAMP AS event_datehour_utc
        FROM data_ad_xdevice.fact_delivery_event f
            JOIN {MAP_TABLE} m ON m.campaign_id = f.campaign_id
        WHERE
            f.event_time BETWEEN '{start}'::TIMESTAMP AND '{end}'::TIMESTAMP;
        "#,
        start = window.start_literal(),
        end = window.end_literal(),
    )
}

/// Imports one CDW's delivery events for the campaigns mapped in UDW.
///
/// # Arguments
/// * `cdw` - The regional source session; `map_prep` lives in it until it is closed
/// * `udw` - The analytics warehouse holding the sales orders and the destination
/// * `job` - Tables and window
/// * `source` - Name of the CDW profile, used for the prep table and logs
///
/// # Returns
/// The number of distinct exposure rows staged.
pub async fn import_source<S, U>(
    cdw: &mut S,
    udw: &U,
    job: &ExposureJob,
    source: &str,
) -> Result<u64, Error>
where
    S: SourceWarehouse + ?Sized,
    U: AnalyticsWarehouse + ?Sized,
{
    let map_rows = udw
        .query(&campaign_map_query(&job.sales_order_table, &job.window)?)
        .await?;
    let mappings = parse_campaign_map(&map_rows)?;
    if mappings.is_empty() {
        warn!("no campaigns mapped for {}, nothing to update", source);
        return Ok(0);
    }
    info!("UDW campaign map has {} entries", mappings.len());

    cdw.execute(&format!(
        "DROP TABLE IF EXISTS {MAP_TABLE}; CREATE TEMP TABLE {MAP_TABLE} (vao BIGINT, campaign_id BIGINT);"
    ))
    .await?;
    cdw.load_campaign_map(MAP_TABLE, &mappings).await?;

    info!("CDW getting exposures from {}", source);
    let records = cdw.fetch_exposures(&exposure_query(&job.window)).await?;

    let ctx = SessionContext::new();
    let rows = stage_distinct(exposures_to_df(&records, &ctx)?).await?;
    if rows.is_empty() {
        warn!("no exposures to update from {}", source);
        return Ok(0);
    }

    let prep_table = format!("EXPOSURE_PREP_{}", source.to_ascii_uppercase());
    let merge_sql = sql::insert_missing(
        &job.destination_table,
        &prep_table,
        &EXPOSURE_COLUMNS,
        &EXPOSURE_COLUMNS,
    )?;

    let loaded = merge_new_rows(udw, &prep_table, PREP_COLUMNS_DDL, &rows, &merge_sql).await?;
    info!("{} exposure rows from {} merged into {}", loaded, source, job.destination_table);

    Ok(loaded)
}
