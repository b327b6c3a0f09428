use crate::cdw::{AppUsageRecord, ExposureRecord};
use crate::error::Error;
use crate::window::TIMESTAMP_FORMAT;
use datafusion::arrow::array::{Array, Int64Builder, RecordBatch, StringArray, StringBuilder};
use datafusion::arrow::compute::{cast_with_options, CastOptions};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::prelude::{DataFrame, SessionContext};
use std::sync::Arc;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Rows rendered as text, the shape the UDW bulk loader and query results share.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextRows {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Option<String>>>,
}

impl TextRows {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values of `column`, skipping nulls.
    pub fn column_values(&self, column: &str) -> Result<Vec<String>, Error> {
        let index = self
            .columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
            .ok_or_else(|| Error::UnexpectedResponse {
                message: format!("result has no column '{}'", column),
            })?;

        Ok(self
            .values
            .iter()
            .filter_map(|row| row.get(index).cloned().flatten())
            .collect())
    }
}

/// Creates the schema for staged app-usage rows.
///
/// Timestamps and dates are carried as already formatted text, since the regional
/// warehouses disagree on the native types.
pub fn app_usage_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("tifa", DataType::Utf8, false),
        Field::new("app_usage_datetime", DataType::Utf8, false),
        Field::new("country", DataType::Utf8, false),
        Field::new("app_id", DataType::Utf8, false),
        Field::new("time_spent_min", DataType::Int64, false),
        Field::new("usage_count", DataType::Int64, false),
        Field::new("date_imported", DataType::Utf8, false),
    ]))
}

pub fn exposure_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("vao", DataType::Int64, false),
        Field::new("device_country", DataType::Utf8, false),
        Field::new("campaign_id", DataType::Int64, false),
        Field::new("flight_id", DataType::Int64, false),
        Field::new("creative_id", DataType::Int64, false),
        Field::new("event_datehour_utc", DataType::Utf8, false),
    ]))
}

pub fn identity_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![Field::new("psid", DataType::Utf8, false)]))
}

/// Converts app-usage records to a DataFrame, normalising every column to the staging types.
///
/// # Arguments
/// * `records` - A slice of [`AppUsageRecord`] read from a CDW
/// * `ctx` - A reference to the [`SessionContext`] for DataFrame operations
///
/// # Returns
/// A Result containing either a [`DataFrame`] or an [`Error`]
pub fn app_usage_to_df(records: &[AppUsageRecord], ctx: &SessionContext) -> Result<DataFrame, Error> {
    let num_entries = records.len();

    let mut tifa_builder = StringBuilder::with_capacity(num_entries, num_entries * 36);
    let mut datetime_builder = StringBuilder::with_capacity(num_entries, num_entries * 19);
    let mut country_builder = StringBuilder::with_capacity(num_entries, num_entries * 2);
    let mut app_id_builder = StringBuilder::with_capacity(num_entries, num_entries * 16);
    let mut time_spent_builder = Int64Builder::with_capacity(num_entries);
    let mut usage_count_builder = Int64Builder::with_capacity(num_entries);
    let mut date_imported_builder = StringBuilder::with_capacity(num_entries, num_entries * 10);

    for record in records {
        tifa_builder.append_value(&record.tifa);
        datetime_builder.append_value(record.app_usage_datetime.format(TIMESTAMP_FORMAT).to_string());
        country_builder.append_value(&record.country);
        app_id_builder.append_value(&record.app_id);
        time_spent_builder.append_value(record.time_spent_min);
        usage_count_builder.append_value(record.usage_count);
        date_imported_builder.append_value(record.date_imported.format(DATE_FORMAT).to_string());
    }

    let batch = RecordBatch::try_new(
        app_usage_schema(),
        vec![
            Arc::new(tifa_builder.finish()),
            Arc::new(datetime_builder.finish()),
            Arc::new(country_builder.finish()),
            Arc::new(app_id_builder.finish()),
            Arc::new(time_spent_builder.finish()),
            Arc::new(usage_count_builder.finish()),
            Arc::new(date_imported_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

pub fn exposures_to_df(records: &[ExposureRecord], ctx: &SessionContext) -> Result<DataFrame, Error> {
    let num_entries = records.len();

    let mut vao_builder = Int64Builder::with_capacity(num_entries);
    let mut country_builder = StringBuilder::with_capacity(num_entries, num_entries * 2);
    let mut campaign_builder = Int64Builder::with_capacity(num_entries);
    let mut flight_builder = Int64Builder::with_capacity(num_entries);
    let mut creative_builder = Int64Builder::with_capacity(num_entries);
    let mut datehour_builder = StringBuilder::with_capacity(num_entries, num_entries * 19);

    for record in records {
        vao_builder.append_value(record.vao);
        country_builder.append_value(&record.device_country);
        campaign_builder.append_value(record.campaign_id);
        flight_builder.append_value(record.flight_id);
        creative_builder.append_value(record.creative_id);
        datehour_builder.append_value(record.event_datehour_utc.format(TIMESTAMP_FORMAT).to_string());
    }

    let batch = RecordBatch::try_new(
        exposure_schema(),
        vec![
            Arc::new(vao_builder.finish()),
            Arc::new(country_builder.finish()),
            Arc::new(campaign_builder.finish()),
            Arc::new(flight_builder.finish()),
            Arc::new(creative_builder.finish()),
            Arc::new(datehour_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

pub fn identities_to_df<'a, I>(psids: I, ctx: &SessionContext) -> Result<DataFrame, Error>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut builder = StringBuilder::new();
    for psid in psids {
        builder.append_value(psid);
    }

    let batch = RecordBatch::try_new(identity_schema(), vec![Arc::new(builder.finish())])?;
    Ok(ctx.read_batch(batch)?)
}

/// Deduplicates the DataFrame and renders every column as text for loading.
///
/// # Arguments
/// * `df` - The staged DataFrame
///
/// # Returns
/// A Result containing either the distinct rows as [`TextRows`] or an [`Error`]
pub async fn stage_distinct(df: DataFrame) -> Result<TextRows, Error> {
    let columns: Vec<String> = df
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();

    let batches: Vec<RecordBatch> = df.distinct()?.collect().await?;

    let mut values = Vec::new();
    for batch in batches {
        let text_columns = batch
            .columns()
            .iter()
            .map(|column| {
                if column.data_type() != &DataType::Utf8 {
                    cast_with_options(column.as_ref(), &DataType::Utf8, &CastOptions::default())
                } else {
                    Ok(column.clone())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let arrays = text_columns
            .iter()
            .map(|column| {
                column
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| Error::UnexpectedResponse {
                        message: "staged column did not cast to text".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for row in 0..batch.num_rows() {
            values.push(
                arrays
                    .iter()
                    .map(|array| array.is_valid(row).then(|| array.value(row).to_string()))
                    .collect(),
            );
        }
    }

    Ok(TextRows { columns, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn timestamp(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    fn app_usage(tifa: &str, minutes: i64) -> AppUsageRecord {
        AppUsageRecord {
            tifa: tifa.to_string(),
            app_usage_datetime: timestamp("2024-05-01 10:15:00"),
            country: "DE".to_string(),
            app_id: "3201808016802".to_string(),
            time_spent_min: minutes,
            usage_count: 1,
            date_imported: NaiveDate::from_ymd_opt(2024, 5, 15).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_app_usage_schema() {
        let schema = app_usage_schema();
        assert_eq!(schema.fields().len(), 7);
        assert_eq!(schema.field(0).name(), "tifa");
        assert_eq!(schema.field(4).name(), "time_spent_min");
        assert_eq!(schema.field(6).name(), "date_imported");
    }

    #[tokio::test]
    async fn test_exposure_schema() {
        let schema = exposure_schema();
        assert_eq!(schema.fields().len(), 6);
        assert_eq!(schema.field(0).name(), "vao");
        assert_eq!(schema.field(5).name(), "event_datehour_utc");
    }

    #[tokio::test]
    async fn test_app_usage_is_formatted_and_deduplicated() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let records = vec![app_usage("tifa-1", 12), app_usage("tifa-1", 12), app_usage("tifa-2", 3)];

        let df = app_usage_to_df(&records, &ctx)?;
        let mut rows = stage_distinct(df).await?;
        rows.values.sort();

        assert_eq!(rows.columns[1], "app_usage_datetime");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.values[0],
            vec![
                Some("tifa-1".to_string()),
                Some("2024-05-01 10:15:00".to_string()),
                Some("DE".to_string()),
                Some("3201808016802".to_string()),
                Some("12".to_string()),
                Some("1".to_string()),
                Some("2024-05-15".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_exposures_to_text_rows() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let records = vec![ExposureRecord {
            vao: 77,
            device_country: "GB".to_string(),
            campaign_id: 1001,
            flight_id: 2002,
            creative_id: 3003,
            event_datehour_utc: timestamp("2024-04-30 23:00:00"),
        }];

        let rows = stage_distinct(exposures_to_df(&records, &ctx)?).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.column_values("campaign_id")?, vec!["1001".to_string()]);
        assert_eq!(
            rows.column_values("event_datehour_utc")?,
            vec!["2024-04-30 23:00:00".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_frame_keeps_columns() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let rows = stage_distinct(app_usage_to_df(&[], &ctx)?).await?;
        assert!(rows.is_empty());
        assert_eq!(rows.columns.len(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_identities_to_df() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let psids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let rows = stage_distinct(identities_to_df(&psids, &ctx)?).await?;

        let mut values = rows.column_values("PSID")?;
        values.sort();
        assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn test_column_values_missing_column() {
        let rows = TextRows::default();
        assert!(matches!(
            rows.column_values("psid").unwrap_err(),
            Error::UnexpectedResponse { .. }
        ));
    }
}
