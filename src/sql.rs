use crate::error::Error;
use crate::region::Country;

/// Renders a string as a single-quoted SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Checks a possibly qualified identifier such as `udw_clientsolutions_cs.app_usage`.
///
/// Only `[A-Za-z0-9_$]` segments separated by dots are accepted, none may start with a digit.
pub fn identifier(name: &str) -> Result<&str, Error> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        });

    if valid {
        Ok(name)
    } else {
        Err(Error::InvalidIdentifier {
            identifier: name.to_string(),
        })
    }
}

/// Checks a stage location such as `@db.schema.stage/some/path/`.
pub fn stage_location(location: &str) -> Result<&str, Error> {
    let invalid = || Error::InvalidIdentifier {
        identifier: location.to_string(),
    };

    let rest = location.strip_prefix('@').ok_or_else(invalid)?;
    let (stage, path) = rest.split_once('/').unwrap_or((rest, ""));
    identifier(stage).map_err(|_| invalid())?;

    let path_ok = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if path_ok && !path.contains("..") {
        Ok(location)
    } else {
        Err(invalid())
    }
}

/// `('AT', 'DE')` for use after `IN`.
pub fn country_list(countries: &[Country]) -> String {
    let quoted: Vec<String> = countries.iter().map(|c| quote_literal(c.as_str())).collect();
    format!("({})", quoted.join(", "))
}

/// Inserts every row of `source` into `destination` that has no match on `key_columns`.
///
/// `columns` are the selected source expressions, in destination column order.
pub fn insert_missing(
    destination: &str,
    source: &str,
    columns: &[&str],
    key_columns: &[&str],
) -> Result<String, Error> {
    let destination = identifier(destination)?;
    let source = identifier(source)?;
    for column in columns.iter().chain(key_columns) {
        identifier(column)?;
    }

    let select = columns.join("\n                ,");
    let matches = key_columns
        .iter()
        .map(|c| format!("old_data.{c} = new_data.{c}"))
        .collect::<Vec<_>>()
        .join("\n                        AND ");

    Ok(format!(
        r#"
        INSERT INTO {destination} (
            SELECT
                {select}
            FROM {source} AS new_data
            WHERE
                NOT EXISTS (
                    SELECT 1
                    FROM {destination} AS old_data
                    WHERE
                        {matches}
                )
        );
        "#
    ))
}
