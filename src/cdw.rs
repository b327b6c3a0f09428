use crate::config::CdwProfile;
use crate::error::Error;
use crate::sql;
use chrono::{NaiveDate, NaiveDateTime};
use log::info;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};

// Postgres caps a statement at 65535 bind parameters
const MAP_INSERT_CHUNK_ROWS: usize = 1_000;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SourceWarehouse: Send {
    /// Runs one or more `;` separated statements without binding or returning rows.
    /// Temp tables created here stay visible until [`SourceWarehouse::close`].
    async fn execute(&mut self, sql: &str) -> Result<(), Error>;

    /// Runs a query whose only column is a psid and returns the non-null values.
    async fn fetch_identities(&mut self, sql: &str) -> Result<Vec<String>, Error>;

    async fn fetch_app_usage(&mut self, sql: &str) -> Result<Vec<AppUsageRecord>, Error>;

    async fn fetch_exposures(&mut self, sql: &str) -> Result<Vec<ExposureRecord>, Error>;

    /// Inserts campaign mappings into an existing `(vao, campaign_id)` table with bound parameters.
    async fn load_campaign_map(
        &mut self,
        table: &str,
        mappings: &[CampaignMapping],
    ) -> Result<u64, Error>;

    /// Closes the session. Further calls fail with [`Error::ConnectionClosed`].
    async fn close(&mut self) -> Result<(), Error>;
}

/// One app session aggregate as read from a regional CDW.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AppUsageRecord {
    pub tifa: String,
    pub app_usage_datetime: NaiveDateTime,
    pub country: String,
    pub app_id: String,
    pub time_spent_min: i64,
    pub usage_count: i64,
    pub date_imported: NaiveDate,
}

/// One hourly ad delivery as read from a regional CDW.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ExposureRecord {
    pub vao: i64,
    pub device_country: String,
    pub campaign_id: i64,
    pub flight_id: i64,
    pub creative_id: i64,
    pub event_datehour_utc: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CampaignMapping {
    pub vao: i64,
    pub campaign_id: i64,
}

/// A single CDW session. Kept as one connection rather than a pool so temp tables persist.
pub struct CdwClient {
    conn: Option<PgConnection>,
}

impl CdwClient {
    pub async fn connect(profile: &CdwProfile) -> Result<Self, Error> {
        let options = PgConnectOptions::new()
            .host(&profile.host)
            .port(profile.port)
            .database(&profile.dbname)
            .username(&profile.user)
            .password(&profile.password)
            .ssl_mode(PgSslMode::Prefer);

        let conn = PgConnection::connect_with(&options).await?;
        info!("CDW connected to {}/{}", profile.host, profile.dbname);

        Ok(CdwClient { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut PgConnection, Error> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }
}

#[async_trait::async_trait]
impl SourceWarehouse for CdwClient {
    async fn execute(&mut self, sql: &str) -> Result<(), Error> {
        let conn = self.conn()?;
        sqlx::Executor::execute(conn, sql).await?;
        Ok(())
    }

    async fn fetch_identities(&mut self, sql: &str) -> Result<Vec<String>, Error> {
        let conn = self.conn()?;
        let psids: Vec<Option<String>> = sqlx::query_scalar(sql).fetch_all(conn).await?;
        Ok(psids.into_iter().flatten().collect())
    }

    async fn fetch_app_usage(&mut self, sql: &str) -> Result<Vec<AppUsageRecord>, Error> {
        let conn = self.conn()?;
        Ok(sqlx::query_as::<_, AppUsageRecord>(sql).fetch_all(conn).await?)
    }

    async fn fetch_exposures(&mut self, sql: &str) -> Result<Vec<ExposureRecord>, Error> {
        let conn = self.conn()?;
        Ok(sqlx::query_as::<_, ExposureRecord>(sql).fetch_all(conn).await?)
    }

    async fn load_campaign_map(
        &mut self,
        table: &str,
        mappings: &[CampaignMapping],
    ) -> Result<u64, Error> {
        let table = sql::identifier(table)?.to_string();
        let conn = self.conn()?;

        let mut inserted = 0;
        for chunk in mappings.chunks(MAP_INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (vao, campaign_id) ", table));
            builder.push_values(chunk, |mut row, mapping| {
                row.push_bind(mapping.vao).push_bind(mapping.campaign_id);
            });
            inserted += builder.build().execute(&mut *conn).await?.rows_affected();
        }

        Ok(inserted)
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
