use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// A reporting region. Everything except `UdwNa` is served by a regional CDW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    UdwNa,
    CdwEu,
    CdwNordics,
    CdwApac,
    CdwSa,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::UdwNa => "udw_na",
            Region::CdwEu => "cdw_eu",
            Region::CdwNordics => "cdw_nordics",
            Region::CdwApac => "cdw_apac",
            Region::CdwSa => "cdw_sa",
        }
    }

    /// Name of the CDW profile used when the config file does not override it.
    pub fn default_profile(&self) -> Option<&'static str> {
        match self {
            Region::UdwNa => None,
            Region::CdwEu | Region::CdwNordics => Some("personalAccountEU"),
            Region::CdwApac => Some("personalAccountAPAC"),
            Region::CdwSa => Some("personalAccountSA"),
        }
    }

    pub fn is_cdw(&self) -> bool {
        !matches!(self, Region::UdwNa)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udw_na" => Ok(Region::UdwNa),
            "cdw_eu" => Ok(Region::CdwEu),
            "cdw_nordics" => Ok(Region::CdwNordics),
            "cdw_apac" => Ok(Region::CdwApac),
            "cdw_sa" => Ok(Region::CdwSa),
            _ => Err(Error::InvalidRegion {
                region: s.to_string(),
            }),
        }
    }
}

/// An upper-case ISO 3166 alpha-2 country code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Country(String);

impl Country {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn lower(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Country {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Country(code.to_ascii_uppercase()))
        } else {
            Err(Error::InvalidCountry {
                country: s.to_string(),
            })
        }
    }
}

/// Parses a comma separated list such as `"AT, DE, ES"`. Blank entries are skipped.
pub fn parse_countries(list: &str) -> Result<Vec<Country>, Error> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Country::from_str)
        .collect()
}

pub fn join_countries(countries: &[Country]) -> String {
    countries
        .iter()
        .map(Country::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
