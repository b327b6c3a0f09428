use crate::error::Error;
use crate::region::Region;
use clap::Args as ClapArgs;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "./config.toml";
const UDW_PROFILE: &str = "serviceAccount";
const LOCK_DIR: &str = "./";
const STATEMENT_TIMEOUT_SECS: &str = "3600";

#[derive(ClapArgs, Debug, Clone)]
pub struct Config {
    #[arg(long, default_value = CONFIG_FILE, env = "UDW_SYNC_CONFIG")]
    pub(crate) config_file: PathBuf,

    #[arg(long, default_value = UDW_PROFILE, env = "UDW_PROFILE")]
    pub(crate) udw_profile: String,

    /// Webhook notified when a job fails. Nothing is sent when unset.
    #[arg(long, env = "FAILURE_WEBHOOK_URL")]
    pub(crate) webhook_url: Option<String>,

    #[arg(long, default_value = LOCK_DIR, env = "LOCK_DIR")]
    pub(crate) lock_dir: PathBuf,

    #[arg(long, default_value = STATEMENT_TIMEOUT_SECS, env = "STATEMENT_TIMEOUT_SECS")]
    pub(crate) statement_timeout_secs: u64,
}

/// Connection details for a regional CDW (Postgres wire protocol).
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CdwProfile {
    pub host: String,
    #[serde(default = "default_cdw_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

fn default_cdw_port() -> u16 {
    5439
}

/// Connection details and session context for the UDW SQL API.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UdwProfile {
    pub account: String,
    pub user: String,
    pub token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub role: Option<String>,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    /// Overrides `https://<account>.snowflakecomputing.com`.
    pub url: Option<String>,
}

fn default_token_type() -> String {
    "OAUTH".to_string()
}

impl UdwProfile {
    pub fn base_url(&self) -> String {
        match &self.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.snowflakecomputing.com", self.account),
        }
    }
}

/// Named connection profiles read from the TOML config file.
#[derive(Deserialize, Debug, Default)]
pub struct Profiles {
    #[serde(default)]
    cdw: HashMap<String, CdwProfile>,

    #[serde(default)]
    udw: HashMap<String, UdwProfile>,

    /// Region name to CDW profile name, overriding [`Region::default_profile`].
    #[serde(default)]
    regions: HashMap<String, String>,
}

impl Profiles {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        Ok(toml::from_str(contents)?)
    }

    pub fn cdw(&self, name: &str) -> Result<&CdwProfile, Error> {
        self.cdw.get(name).ok_or_else(|| Error::ProfileNotFound {
            kind: "cdw",
            name: name.to_string(),
        })
    }

    pub fn udw(&self, name: &str) -> Result<&UdwProfile, Error> {
        self.udw.get(name).ok_or_else(|| Error::ProfileNotFound {
            kind: "udw",
            name: name.to_string(),
        })
    }

    /// Resolves the CDW profile serving `region`.
    pub fn cdw_for_region(&self, region: Region) -> Result<&CdwProfile, Error> {
        let name = match self.regions.get(region.as_str()) {
            Some(name) => name.as_str(),
            None => region.default_profile().ok_or(Error::InvalidRegion {
                region: region.to_string(),
            })?,
        };
        self.cdw(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
        [cdw.personalAccountEU]
        host = "cdw-eu.example.com"
        dbname = "cdw"
        user = "reader"
        password = "secret"

        [cdw.personalAccountAPAC]
        host = "cdw-apac.example.com"
        port = 5440
        dbname = "cdw"
        user = "reader"
        password = "secret"

        [udw.serviceAccount]
        account = "ab12345"
        user = "svc"
        token = "token"
        role = "REPORTING_ROLE"
        warehouse = "DEFAULT_WH"
        database = "UDW_PROD"
        schema = "UDW_CLIENTSOLUTIONS_CS"

        [regions]
        cdw_sa = "personalAccountAPAC"
    "#;

    #[test]
    fn test_parse_profiles() {
        let profiles = Profiles::parse(SAMPLE).unwrap();

        let eu = profiles.cdw("personalAccountEU").unwrap();
        assert_eq!(eu.port, 5439);
        assert_eq!(eu.host, "cdw-eu.example.com");

        let udw = profiles.udw("serviceAccount").unwrap();
        assert_eq!(udw.token_type, "OAUTH");
        assert_eq!(udw.base_url(), "https://ab12345.snowflakecomputing.com");
    }

    #[test]
    fn test_region_profile_resolution() {
        let profiles = Profiles::parse(SAMPLE).unwrap();

        let nordics = profiles.cdw_for_region(Region::CdwNordics).unwrap();
        assert_eq!(nordics.host, "cdw-eu.example.com");

        let sa = profiles.cdw_for_region(Region::CdwSa).unwrap();
        assert_eq!(sa.port, 5440);

        assert!(matches!(
            profiles.cdw_for_region(Region::UdwNa).unwrap_err(),
            Error::InvalidRegion { .. }
        ));
    }

    #[test]
    fn test_missing_profile() {
        let profiles = Profiles::parse(SAMPLE).unwrap();
        assert!(matches!(
            profiles.udw("personalAccount").unwrap_err(),
            Error::ProfileNotFound { kind: "udw", name } if name == "personalAccount"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let profiles = Profiles::load(file.path()).unwrap();
        assert!(profiles.cdw("personalAccountAPAC").is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Profiles::load(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result.unwrap_err(), Error::Io(_)));
    }

    #[test]
    fn test_url_override_trims_slash() {
        let mut profiles = Profiles::parse(SAMPLE).unwrap();
        let udw = profiles.udw.get_mut("serviceAccount").unwrap();
        udw.url = Some("http://localhost:8080/".to_string());
        assert_eq!(udw.base_url(), "http://localhost:8080");
    }
}
