//! Automatic backup-set naming.
//!
//! The configured `(format, priority, keep_days, force_full)` tuples are
//! tried in order against the client's clock; the first strftime expansion
//! whose name is still unused wins. Nothing free means a timestamped
//! fallback at priority zero.

use chrono::{Local, TimeZone};
use meta_db::MetaDb;

/// Resolved auto-name decision.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoName {
    pub name: String,
    pub priority: i64,
    pub keep_days: i64,
    pub force_full: bool,
}

/// Pick the backup-set name for a session started at `client_time`.
pub fn calc_auto_info(
    db: &MetaDb,
    formats: &[String],
    priorities: &[i64],
    keep_days: &[i64],
    force_full: &[bool],
    client_time: f64,
) -> Result<AutoName, meta_db::DbError> {
    let when = Local
        .timestamp_opt(client_time as i64, 0)
        .single()
        .unwrap_or_else(Local::now);

    for (i, fmt) in formats.iter().enumerate() {
        let name = when.format(fmt).to_string();
        if db.check_backup_set_name(&name)? {
            return Ok(AutoName {
                name,
                priority: priorities.get(i).copied().unwrap_or(0),
                keep_days: keep_days.get(i).copied().unwrap_or(0),
                force_full: force_full.get(i).copied().unwrap_or(false),
            });
        }
    }

    Ok(AutoName {
        name: when.format("Backup_%Y-%m-%d_%H:%M:%S").to_string(),
        priority: 0,
        keep_days: 0,
        force_full: false,
    })
}

/// Parse a comma-separated override list into typed slots.
pub fn parse_list<T: std::str::FromStr>(raw: &str) -> Vec<T> {
    raw.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn db(dir: &Path) -> MetaDb {
        MetaDb::open(dir, "alice", true, 0, None).unwrap()
    }

    #[test]
    fn first_free_format_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = db(dir.path());
        let formats = vec!["Monthly-%Y-%m".to_string(), "Daily-%Y-%m-%d".to_string()];
        let auto = calc_auto_info(&db, &formats, &[40, 20], &[365, 30], &[true, false], 1_700_000_000.0)
            .unwrap();
        assert!(auto.name.starts_with("Monthly-"));
        assert_eq!(auto.priority, 40);
        assert!(auto.force_full);

        // consume the monthly slot; the daily one is next
        db.new_backup_set(&auto.name, "s1", auto.priority, 1_700_000_000.0, "v", "a", true, None)
            .unwrap();
        let auto2 = calc_auto_info(&db, &formats, &[40, 20], &[365, 30], &[true, false], 1_700_000_000.0)
            .unwrap();
        assert!(auto2.name.starts_with("Daily-"));
        assert_eq!(auto2.priority, 20);
    }

    #[test]
    fn exhausted_formats_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = db(dir.path());
        let formats = vec!["Only-%Y".to_string()];
        let first =
            calc_auto_info(&db, &formats, &[1], &[1], &[false], 1_700_000_000.0).unwrap();
        db.new_backup_set(&first.name, "s1", 1, 1_700_000_000.0, "v", "a", false, None)
            .unwrap();
        let fallback =
            calc_auto_info(&db, &formats, &[1], &[1], &[false], 1_700_000_000.0).unwrap();
        assert!(fallback.name.starts_with("Backup_"));
        assert_eq!(fallback.priority, 0);
    }

    #[test]
    fn list_parsing() {
        assert_eq!(parse_list::<i64>("40, 30,20"), vec![40, 30, 20]);
        assert_eq!(parse_list::<bool>("true,false"), vec![true, false]);
    }
}
