use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime};

const PARTITION_DAY_FORMAT: &str = "%Y%m%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bounds on the hourly `YYYYMMDDHH` partition column used by the registration queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: String,
    pub end: String,
}

/// The 45 day registration window, ending with the last hour of yesterday.
pub fn last_45_days(today: NaiveDate) -> PartitionRange {
    PartitionRange {
        start: partition_hour(today - Days::new(45), 23),
        end: partition_hour(today - Days::new(1), 23),
    }
}

/// Every hour of yesterday.
pub fn current_day(today: NaiveDate) -> PartitionRange {
    let yesterday = today - Days::new(1);
    PartitionRange {
        start: partition_hour(yesterday, 0),
        end: partition_hour(yesterday, 23),
    }
}

fn partition_hour(date: NaiveDate, hour: u32) -> String {
    format!("{}{:02}", date.format(PARTITION_DAY_FORMAT), hour)
}

/// A reporting window over event timestamps.
///
/// `start` already accounts for the quarter start, so queries only need the two bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ReportingWindow {
    /// Two weeks back through yesterday 23:59:59. Used by the app-usage import.
    pub fn trailing_weeks(today: NaiveDate, weeks: u64) -> Self {
        ReportingWindow {
            start: (today - Days::new(7 * weeks)).and_time(NaiveTime::MIN),
            end: end_of_yesterday(today),
        }
    }

    /// `months` back, or the start of the current quarter if that is earlier,
    /// through yesterday 23:59:59. Used by the exposure import.
    pub fn trailing_months_or_quarter(today: NaiveDate, months: u32) -> Self {
        let months_ago = today
            .checked_sub_months(Months::new(months))
            .unwrap_or(NaiveDate::MIN);
        let start = months_ago.min(quarter_start(today));

        ReportingWindow {
            start: start.and_time(NaiveTime::MIN),
            end: end_of_yesterday(today),
        }
    }

    pub fn start_partition_day(&self) -> String {
        self.start.format(PARTITION_DAY_FORMAT).to_string()
    }

    pub fn end_partition_day(&self) -> String {
        self.end.format(PARTITION_DAY_FORMAT).to_string()
    }

    pub fn start_literal(&self) -> String {
        self.start.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn end_literal(&self) -> String {
        self.end.format(TIMESTAMP_FORMAT).to_string()
    }
}

fn end_of_yesterday(today: NaiveDate) -> NaiveDateTime {
    let yesterday = today - Days::new(1);
    yesterday.and_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN))
}

pub fn quarter_start(date: NaiveDate) -> NaiveDate {
    let month = (date.month0() / 3) * 3 + 1;
    NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_registration_windows() {
        let today = date("2024-03-01");

        let last_45 = last_45_days(today);
        assert_eq!(last_45.start, "2024011623");
        assert_eq!(last_45.end, "2024022923");

        let current = current_day(today);
        assert_eq!(current.start, "2024022900");
        assert_eq!(current.end, "2024022923");
    }

    #[test]
    fn test_trailing_weeks() {
        let window = ReportingWindow::trailing_weeks(date("2024-05-15"), 2);
        assert_eq!(window.start_literal(), "2024-05-01 00:00:00");
        assert_eq!(window.end_literal(), "2024-05-14 23:59:59");
        assert_eq!(window.start_partition_day(), "20240501");
        assert_eq!(window.end_partition_day(), "20240514");
    }

    #[test]
    fn test_trailing_months_uses_earliest_start() {
        let window = ReportingWindow::trailing_months_or_quarter(date("2024-08-20"), 6);
        assert_eq!(window.start_literal(), "2024-02-20 00:00:00");

        let window = ReportingWindow::trailing_months_or_quarter(date("2024-08-20"), 1);
        assert_eq!(window.start_literal(), "2024-07-01 00:00:00");
    }

    #[test]
    fn test_quarter_start() {
        assert_eq!(quarter_start(date("2024-12-31")), date("2024-10-01"));
        assert_eq!(quarter_start(date("2024-01-01")), date("2024-01-01"));
        assert_eq!(quarter_start(date("2024-05-17")), date("2024-04-01"));
    }
}
