use crate::config::UdwProfile;
use crate::error::Error;
use crate::frame::TextRows;
use crate::sql;
use log::{debug, info};
use reqwest::{header::AUTHORIZATION, Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const BULK_CHUNK_ROWS: usize = 16_384;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AnalyticsWarehouse: Send + Sync + 'static {
    /// Runs one or more `;` separated statements in a single session and waits for them to finish.
    /// Temp tables created here do not outlive the call.
    async fn execute(&self, sql: &str) -> Result<(), Error>;

    /// Runs a single query and returns every row as text, with lower-case column names.
    async fn query(&self, sql: &str) -> Result<TextRows, Error>;

    /// Appends `rows` to `table` using array bindings, in chunks.
    /// # Returns
    /// The number of rows sent.
    async fn bulk_insert(&self, table: &str, rows: &TextRows) -> Result<u64, Error>;
}

/// Client for the UDW SQL API. Each request carries the full session context,
/// so no `USE ROLE/DATABASE/WAREHOUSE/SCHEMA` state is needed.
#[derive(Clone)]
pub struct SnowflakeClient {
    client: Client,
    base_url: String,
    token: String,
    token_type: String,
    context: SessionContext,
    timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
struct SessionContext {
    role: Option<String>,
    warehouse: String,
    database: String,
    schema: String,
}

#[derive(Serialize, Debug)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    warehouse: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bindings: Option<BTreeMap<String, Binding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<StatementParameters>,
}

#[derive(Serialize, Debug, PartialEq)]
struct Binding {
    #[serde(rename = "type")]
    kind: &'static str,
    value: Vec<Option<String>>,
}

#[derive(Serialize, Debug)]
struct StatementParameters {
    #[serde(rename = "MULTI_STATEMENT_COUNT")]
    multi_statement_count: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    code: Option<String>,
    message: Option<String>,
    statement_handle: Option<String>,
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<ColumnType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Deserialize, Debug)]
struct ColumnType {
    name: String,
}

impl SnowflakeClient {
    pub fn new(profile: &UdwProfile, timeout_secs: u64) -> Self {
        SnowflakeClient {
            client: Client::new(),
            base_url: profile.base_url(),
            token: profile.token.to_string(),
            token_type: profile.token_type.to_string(),
            context: SessionContext {
                role: profile.role.clone(),
                warehouse: profile.warehouse.to_string(),
                database: profile.database.to_string(),
                schema: profile.schema.to_string(),
            },
            timeout_secs,
        }
    }

    fn statements_url(&self, handle: Option<&str>) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?;
            segments.pop_if_empty().extend(&["api", "v2", "statements"]);
            if let Some(handle) = handle {
                segments.push(handle);
            }
        }
        Ok(url)
    }

    fn request<'a>(
        &'a self,
        statement: &'a str,
        bindings: Option<BTreeMap<String, Binding>>,
        multi_statement: bool,
    ) -> StatementRequest<'a> {
        StatementRequest {
            statement,
            timeout: self.timeout_secs,
            database: &self.context.database,
            schema: &self.context.schema,
            warehouse: &self.context.warehouse,
            role: self.context.role.as_deref(),
            bindings,
            parameters: multi_statement.then(|| StatementParameters {
                multi_statement_count: "0".to_string(),
            }),
        }
    }

    async fn submit(&self, request: &StatementRequest<'_>) -> Result<StatementResponse, Error> {
        let url = self.statements_url(None)?;
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(TOKEN_TYPE_HEADER, &self.token_type)
            .json(request)
            .send()
            .await?;

        let mut response = read_response(resp).await?;

        // 202: still running, poll the handle until the warehouse reports a result
        while let Some(handle) = pending_handle(&response) {
            tokio::time::sleep(POLL_INTERVAL).await;
            debug!("polling UDW statement {}", handle);
            let resp = self
                .client
                .get(self.statements_url(Some(&handle))?)
                .header(AUTHORIZATION, format!("Bearer {}", self.token))
                .header(TOKEN_TYPE_HEADER, &self.token_type)
                .send()
                .await?;
            response = read_response(resp).await?;
        }

        Ok(response.response)
    }

    async fn fetch_partition(&self, handle: &str, partition: usize) -> Result<Vec<Vec<Option<String>>>, Error> {
        let mut url = self.statements_url(Some(handle))?;
        url.query_pairs_mut()
            .append_pair("partition", &partition.to_string());

        let resp = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(TOKEN_TYPE_HEADER, &self.token_type)
            .send()
            .await?;

        Ok(read_response(resp).await?.response.data)
    }
}

struct Polled {
    status: StatusCode,
    response: StatementResponse,
}

fn pending_handle(polled: &Polled) -> Option<String> {
    if polled.status == StatusCode::ACCEPTED {
        polled.response.statement_handle.clone()
    } else {
        None
    }
}

async fn read_response(resp: reqwest::Response) -> Result<Polled, Error> {
    let status = resp.status();
    let body = resp.text().await?;
    let response = parse_response(status, &body)?;
    Ok(Polled { status, response })
}

fn parse_response(status: StatusCode, body: &str) -> Result<StatementResponse, Error> {
    match status {
        StatusCode::OK | StatusCode::ACCEPTED => {
            serde_json::from_str(body).map_err(|err| Error::UnexpectedResponse {
                message: format!("{} ({})", err, status),
            })
        }
        status => {
            let failure: StatementResponse = serde_json::from_str(body).unwrap_or_default();
            Err(Error::Statement {
                code: failure.code.unwrap_or_else(|| status.as_u16().to_string()),
                message: failure
                    .message
                    .unwrap_or_else(|| body.chars().take(500).collect()),
            })
        }
    }
}

/// One TEXT array binding per column, positional from 1.
fn column_bindings(rows: &TextRows, start: usize, end: usize) -> BTreeMap<String, Binding> {
    (0..rows.columns.len())
        .map(|column| {
            let value = rows.values[start..end]
                .iter()
                .map(|row| row.get(column).cloned().flatten())
                .collect();
            ((column + 1).to_string(), Binding { kind: "TEXT", value })
        })
        .collect()
}

fn insert_statement(table: &str, columns: &[String]) -> Result<String, Error> {
    let table = sql::identifier(table)?;
    for column in columns {
        sql::identifier(column)?;
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    ))
}

#[async_trait::async_trait]
impl AnalyticsWarehouse for SnowflakeClient {
    async fn execute(&self, sql: &str) -> Result<(), Error> {
        let request = self.request(sql, None, true);
        self.submit(&request).await?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<TextRows, Error> {
        let request = self.request(sql, None, false);
        let response = self.submit(&request).await?;

        let meta = response.result_set_meta_data.ok_or(Error::UnexpectedResponse {
            message: "query returned no result set metadata".to_string(),
        })?;
        let columns = meta
            .row_type
            .iter()
            .map(|column| column.name.to_ascii_lowercase())
            .collect();

        let mut values = response.data;
        if meta.partition_info.len() > 1 {
            let handle = response.statement_handle.ok_or(Error::UnexpectedResponse {
                message: "partitioned result without a statement handle".to_string(),
            })?;
            for partition in 1..meta.partition_info.len() {
                values.extend(self.fetch_partition(&handle, partition).await?);
            }
        }

        Ok(TextRows { columns, values })
    }

    async fn bulk_insert(&self, table: &str, rows: &TextRows) -> Result<u64, Error> {
        if rows.values.is_empty() {
            return Ok(0);
        }

        let statement = insert_statement(table, &rows.columns)?;
        let mut sent = 0;
        for start in (0..rows.values.len()).step_by(BULK_CHUNK_ROWS) {
            let end = (start + BULK_CHUNK_ROWS).min(rows.values.len());
            let request = self.request(&statement, Some(column_bindings(rows, start, end)), false);
            self.submit(&request).await?;
            sent += (end - start) as u64;
            debug!("sent {} of {} rows to {}", sent, rows.values.len(), table);
        }

        info!("loaded {} rows into {}", sent, table);
        Ok(sent)
    }
}

/// Loads `rows` into a transient prep table, merges them into the destination with
/// `merge_sql`, then drops the prep table. The drop is attempted even when the merge fails.
///
/// # Returns
/// The number of rows loaded into the prep table.
pub async fn merge_new_rows<U: AnalyticsWarehouse + ?Sized>(
    udw: &U,
    prep_table: &str,
    columns_ddl: &str,
    rows: &TextRows,
    merge_sql: &str,
) -> Result<u64, Error> {
    let prep_table = sql::identifier(prep_table)?;
    udw.execute(&format!(
        "CREATE OR REPLACE TRANSIENT TABLE {} ({});",
        prep_table, columns_ddl
    ))
    .await?;

    let merged = async {
        let loaded = udw.bulk_insert(prep_table, rows).await?;
        udw.execute(merge_sql).await?;
        Ok::<u64, Error>(loaded)
    }
    .await;

    let dropped = udw
        .execute(&format!("DROP TABLE IF EXISTS {};", prep_table))
        .await;

    let loaded = merged?;
    dropped?;
    Ok(loaded)
}

/// Replaces the contents of `table` with `rows`.
///
/// Rows are loaded into `<table>_STAGE` first and swapped in with one statement, so a
/// failed load leaves the previous snapshot in place.
pub async fn replace_table<U: AnalyticsWarehouse + ?Sized>(
    udw: &U,
    table: &str,
    columns_ddl: &str,
    rows: &TextRows,
) -> Result<u64, Error> {
    let table = sql::identifier(table)?;
    let stage = format!("{}_STAGE", table);

    udw.execute(&format!(
        "CREATE OR REPLACE TABLE {} ({});",
        stage, columns_ddl
    ))
    .await?;
    let loaded = udw.bulk_insert(&stage, rows).await?;

    udw.execute(&format!(
        "CREATE TABLE IF NOT EXISTS {table} ({columns_ddl});\n\
         ALTER TABLE {table} SWAP WITH {stage};\n\
         DROP TABLE IF EXISTS {stage};"
    ))
    .await?;

    info!("replaced {} with {} rows", table, loaded);
    Ok(loaded)
}
