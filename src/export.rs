use crate::audience::IdentitySet;
use crate::error::Error;
use crate::sql;
use csv::{Terminator, WriterBuilder};
use serde::Serialize;
use std::path::Path;

/// Single-file exports are capped just under the stage limit.
pub const MAX_FILE_SIZE: u64 = 4_900_000_000;

#[derive(Serialize)]
struct IdentityRow<'a> {
    psid: &'a str,
}

/// Writes one psid per line under a `psid` header, overwriting `path`.
pub fn write_identities(path: &Path, psids: &IdentitySet) -> Result<(), Error> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)?;
    writer.write_record(["psid"])?;
    for psid in psids {
        writer.serialize(IdentityRow { psid })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
pub fn read_identities(path: &Path) -> Result<IdentitySet, Error> {
    #[derive(serde::Deserialize)]
    struct OwnedIdentityRow {
        psid: String,
    }

    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    reader
        .deserialize::<OwnedIdentityRow>()
        .map(|row| Ok(row?.psid))
        .collect()
}

/// Unloads the distinct psids of `table` into a single uncompressed CSV on a stage.
pub fn copy_into_stage(
    stage: &str,
    file_name: &str,
    table: &str,
    file_format: &str,
) -> Result<String, Error> {
    let stage = sql::stage_location(stage)?.trim_end_matches('/');
    let table = sql::identifier(table)?;
    let file_format = sql::identifier(file_format)?;
    sql::stage_location(&format!("{}/{}", stage, file_name))?;

    Ok(format!(
        r#"
        COPY INTO {stage}/{file_name}
        FROM (SELECT DISTINCT psid AS "psid" FROM {table})
        file_format = (format_name = {file_format} COMPRESSION = 'none')
        single = TRUE
        header = TRUE
        overwrite = TRUE
        max_file_size = {MAX_FILE_SIZE};
        "#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(ids: &[&str]) -> IdentitySet {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.csv");
        let psids = set(&["a1", "b,2", "c\"3", "d 4"]);

        write_identities(&path, &psids).unwrap();
        assert_eq!(read_identities(&path).unwrap(), psids);
    }

    #[test]
    fn test_csv_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment.csv");

        write_identities(&path, &set(&["x", "y"])).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "psid\nx\ny\n");
    }

    #[test]
    fn test_empty_set_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");

        write_identities(&path, &IdentitySet::new()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "psid\n");
        assert!(read_identities(&path).unwrap().is_empty());
    }

    #[test]
    fn test_read_missing_file() {
        let result = read_identities(Path::new("/nonexistent/segment.csv"));
        assert!(matches!(result.unwrap_err(), Error::Csv(_)));
    }

    #[test]
    fn test_copy_into_stage() {
        let sql = copy_into_stage(
            "@UDW_PROD.UDW_CLIENTSOLUTIONS_CS.audience_planner_remote_files_udw_s/",
            "220601_de_alexa_10per_control.csv",
            "udw_prod.udw_clientsolutions_cs.cdw_de_alexa_new_control",
            "adbiz_data.analytics_csv",
        )
        .unwrap();

        assert!(sql.contains(
            "COPY INTO @UDW_PROD.UDW_CLIENTSOLUTIONS_CS.audience_planner_remote_files_udw_s/220601_de_alexa_10per_control.csv"
        ));
        assert!(sql.contains("FROM (SELECT DISTINCT psid AS \"psid\" FROM udw_prod.udw_clientsolutions_cs.cdw_de_alexa_new_control)"));
        assert!(sql.contains("COMPRESSION = 'none'"));
        assert!(sql.contains("single = TRUE"));
        assert!(sql.contains("max_file_size = 4900000000;"));
    }

    #[test]
    fn test_copy_into_stage_rejects_bad_file_name() {
        let result = copy_into_stage("@stage", "x'; DROP", "t", "fmt");
        assert!(matches!(result.unwrap_err(), Error::InvalidIdentifier { .. }));
    }
}
