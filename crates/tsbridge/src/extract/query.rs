//! Select-statement construction for chunked extraction.

use crate::config::ExtractionConfig;
use crate::model::ColumnInfo;

/// Builds the select statement extracting `columns` from the configured
/// measure.
///
/// The projection lists `columns` in exactly the given order, which
/// fixes the positional layout of every returned row; callers must pass
/// the columns in the order they intend to interpret row values. Both
/// time bounds are inclusive; the limit suffix is appended only when the
/// configured limit is nonzero.
#[must_use]
pub fn build_select(config: &ExtractionConfig, columns: &[ColumnInfo]) -> String {
    let projection = columns
        .iter()
        .map(|column| format!("\"{}\"", column.name))
        .collect::<Vec<_>>()
        .join(", ");

    let measure = &config.measure;
    let mut command = match (&config.from, &config.to) {
        (Some(from), Some(to)) => format!(
            "SELECT {projection}\nFROM \"{measure}\"\nWHERE time >= '{from}' AND time <= '{to}'"
        ),
        (Some(from), None) => {
            format!("SELECT {projection}\nFROM \"{measure}\"\nWHERE time >= '{from}'")
        }
        (None, Some(to)) => {
            format!("SELECT {projection}\nFROM \"{measure}\"\nWHERE time <= '{to}'")
        }
        (None, None) => format!("SELECT {projection}\nFROM \"{measure}\""),
    };

    if config.limit != 0 {
        command.push_str(&format!("\nLIMIT {}", config.limit));
    }
    command
}
