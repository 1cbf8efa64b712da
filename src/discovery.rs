//! # Partition Discovery
//!
//! Resolves a calendar date range and a set of table families into the
//! ordered list of source partitions to migrate, driven by the
//! `partition_table_info` catalog table.
//!
//! Discovery is pure with respect to its inputs: the same source state,
//! range and family set always yields the same descriptors, in
//! `(table_data, from_date)` order.

use chrono::{Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use log::{debug, info, warn};
use postgres::Client;

use crate::domain::errors::{MigrationError, Result};
use crate::domain::models::PartitionDescriptor;
use crate::domain::table_types::TableType;
use crate::pg;

const CATALOG_QUERY: &str = "
    SELECT table_name, table_data, from_date, to_date, cluster_index
    FROM partition_table_info
    WHERE table_data = ANY($1)
      AND use_flag = true
      AND from_date <= $2
      AND to_date >= $3
    ORDER BY table_data, from_date
";

/// Validated discovery input.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub types: Vec<TableType>,
}

impl DiscoveryRequest {
    /// Fails fast on an empty family set or an inverted range.
    pub fn validate(&self) -> Result<()> {
        if self.types.is_empty() {
            return Err(MigrationError::Validation(
                "at least one table type must be selected".to_string(),
            ));
        }
        if self.start > self.end {
            return Err(MigrationError::Validation(format!(
                "invalid date range: {} > {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Millisecond epoch of local midnight starting `date`.
pub fn day_start_millis(date: NaiveDate) -> i64 {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight always exists");
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| midnight.and_utc().timestamp_millis())
}

/// Millisecond epoch of the last instant of `date` (next midnight − 1 ms).
pub fn day_end_millis(date: NaiveDate) -> i64 {
    day_start_millis(date + ChronoDuration::days(1)) - 1
}

/// Runs catalog discovery against the source connection.
pub fn discover(client: &mut Client, request: &DiscoveryRequest) -> Result<Vec<PartitionDescriptor>> {
    request.validate()?;

    let range_start = day_start_millis(request.start);
    let range_end = day_end_millis(request.end);
    let codes: Vec<&str> = request.types.iter().map(|t| t.code()).collect();
    debug!(
        "discovering partitions: types={codes:?} range=[{range_start}, {range_end}]"
    );

    let rows = client.query(CATALOG_QUERY, &[&codes, &range_end, &range_start])?;

    let mut seen = std::collections::HashSet::new();
    let mut partitions = Vec::with_capacity(rows.len());
    for row in rows {
        let child: String = row.get(0);
        let code: String = row.get(1);
        let from_date: i64 = row.get(2);
        let to_date: i64 = row.get(3);
        let cluster_index: bool = row.get(4);

        if from_date > to_date {
            return Err(MigrationError::Validation(format!(
                "catalog row for {child} has from_date > to_date"
            )));
        }
        // Overlapping catalog ranges may surface a child twice; take it once.
        if !seen.insert(child.clone()) {
            continue;
        }

        let table_type = TableType::from_code(&code)?;
        if !pg::table_exists(client, &child)? {
            warn!("catalog lists {child} but the table does not exist; skipping");
            continue;
        }

        partitions.push(PartitionDescriptor {
            parent: table_type.parent_table().to_string(),
            child,
            table_type,
            from_date,
            to_date,
            estimated_rows: None,
            cluster_index,
        });
    }

    attach_row_estimates(client, &mut partitions);
    info!("discovered {} partition(s)", partitions.len());
    Ok(partitions)
}

/// Best-effort planner estimates; failures leave the estimate empty.
fn attach_row_estimates(client: &mut Client, partitions: &mut [PartitionDescriptor]) {
    for partition in partitions.iter_mut() {
        match client.query_opt(
            "SELECT reltuples::bigint FROM pg_class WHERE relname = $1",
            &[&partition.child],
        ) {
            Ok(Some(row)) => partition.estimated_rows = Some(row.get::<_, i64>(0).max(0)),
            Ok(None) => {}
            Err(e) => debug!("row estimate failed for {}: {e}", partition.child),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_empty_type_set_rejected() {
        let request = DiscoveryRequest {
            start: date(2024, 9, 21),
            end: date(2024, 9, 23),
            types: vec![],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let request = DiscoveryRequest {
            start: date(2024, 9, 23),
            end: date(2024, 9, 21),
            types: vec![TableType::PointHistory],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_single_day_range_accepted() {
        let request = DiscoveryRequest {
            start: date(2024, 9, 21),
            end: date(2024, 9, 21),
            types: vec![TableType::PointHistory, TableType::EnergyDisplay],
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_day_bounds_cover_whole_day() {
        let start = day_start_millis(date(2024, 9, 21));
        let end = day_end_millis(date(2024, 9, 21));
        // One day spans 23–25 hours depending on DST, minus the final ms.
        let span = end - start + 1;
        assert!(span >= 23 * 3_600_000 && span <= 25 * 3_600_000);
        assert_eq!(span % 1000, 0);
    }

    #[test]
    fn test_day_bounds_are_contiguous() {
        // The end of one day is exactly 1 ms before the start of the next.
        let end = day_end_millis(date(2024, 9, 21));
        let next_start = day_start_millis(date(2024, 9, 22));
        assert_eq!(end + 1, next_start);
    }

    #[test]
    fn test_range_millis_ordering() {
        let start = day_start_millis(date(2024, 2, 1));
        let end = day_end_millis(date(2024, 2, 29));
        assert!(start < end);
    }
}
