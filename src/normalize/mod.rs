//! Canonicalisation of heterogeneous train-event records.
//!
//! Accepts records with variably named columns, establishes the service
//! date, parses clock times and full datetimes into UTC instants, corrects
//! midnight rollover per train, and assigns stable station ids.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::{NormalizedEvents, TrainClass, TrainEvent};

pub const SCHEMA_VERSION: u32 = 1;

/// One raw input row: column name -> raw text value.
pub type RawEventRecord = BTreeMap<String, String>;

const TIME_COLUMNS: [&str; 4] = ["sched_arr", "sched_dep", "act_arr", "act_dep"];

/// Fixed mapping from known raw column spellings to canonical names.
/// Lookup is case- and whitespace-insensitive via [`canonical_key`].
const COLUMN_MAP: [(&str, &str); 26] = [
    ("train", "train_id"),
    ("train_id", "train_id"),
    ("trainno", "train_id"),
    ("train_no", "train_id"),
    ("train_name", "train_name"),
    ("name", "train_name"),
    ("station", "station_name"),
    ("station_name", "station_name"),
    ("station_id", "station_id"),
    ("station_code", "station_id"),
    ("code", "station_id"),
    ("sched_arr", "sched_arr"),
    ("scheduled_arrival", "sched_arr"),
    ("planned_arrival", "sched_arr"),
    ("sched_dep", "sched_dep"),
    ("scheduled_departure", "sched_dep"),
    ("planned_departure", "sched_dep"),
    ("act_arr", "act_arr"),
    ("actual_arrival", "act_arr"),
    ("real_arrival", "act_arr"),
    ("act_dep", "act_dep"),
    ("actual_departure", "act_dep"),
    ("real_departure", "act_dep"),
    ("service_day", "day"),
    ("day", "day"),
    ("priority", "priority"),
];

/// Lowercase, trim, and collapse internal whitespace to underscores.
fn canonical_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn canonical_column(raw: &str) -> Option<&'static str> {
    let key = canonical_key(raw);
    // stop_seq has no aliases but must survive the mapping
    if key == "stop_seq" || key == "seq" {
        return Some("stop_seq");
    }
    if key == "class" || key == "train_class" {
        return Some("class");
    }
    COLUMN_MAP
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
}

fn rename_record(record: &RawEventRecord) -> RawEventRecord {
    let mut out = RawEventRecord::new();
    for (key, value) in record {
        if let Some(canonical) = canonical_column(key) {
            // first spelling wins so duplicated aliases cannot clobber
            out.entry(canonical.to_string()).or_insert_with(|| value.clone());
        }
    }
    out
}

fn is_zero_placeholder(raw: &str) -> bool {
    matches!(raw.trim(), "00:00" | "00:00:00")
}

/// Parse one time cell: bare `HH:MM(:SS)` combines with the service date at
/// UTC; anything else must be a full datetime.
fn parse_time_cell(raw: &str, service_date: NaiveDate) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&service_date.and_time(t)));
        }
    }
    parse_full_datetime(text)
}

fn parse_full_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Establish the service date: explicit `day` column first, else the date
/// part of the earliest fully-qualified timestamp in the data.
fn establish_service_date(records: &[RawEventRecord]) -> CoreResult<NaiveDate> {
    for record in records {
        if let Some(raw) = record.get("day") {
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                return Ok(date);
            }
        }
    }
    let mut earliest: Option<DateTime<Utc>> = None;
    for record in records {
        for col in TIME_COLUMNS {
            if let Some(raw) = record.get(col) {
                if let Some(dt) = parse_full_datetime(raw.trim()) {
                    earliest = Some(earliest.map_or(dt, |e| e.min(dt)));
                }
            }
        }
    }
    earliest
        .map(|dt| dt.date_naive())
        .ok_or(CoreError::MissingServiceDate)
}

/// Append-only station-name registry backing `station_id` assignment.
///
/// Prior allocations are never renumbered; new names get the next `S{n:04}`
/// id in sorted order, matching the registry on disk.
#[derive(Debug, Default)]
pub struct StationNameMap {
    path: Option<PathBuf>,
    name_to_id: BTreeMap<String, String>,
}

impl StationNameMap {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut name_to_id = BTreeMap::new();
        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)
                .map_err(|e| CoreError::InputDefect(format!("station map: {e}")))?;
            for row in reader.deserialize::<(String, String)>() {
                let (station_id, name) =
                    row.map_err(|e| CoreError::InputDefect(format!("station map: {e}")))?;
                name_to_id.insert(name, station_id);
            }
        }
        Ok(Self {
            path: Some(path),
            name_to_id,
        })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.name_to_id.get(name).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.name_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name_to_id.is_empty()
    }

    /// Allocate ids for unseen names and persist the extended map.
    pub fn ensure(&mut self, names: impl IntoIterator<Item = String>) -> CoreResult<()> {
        let mut unseen: Vec<String> = names
            .into_iter()
            .filter(|n| !n.is_empty() && !self.name_to_id.contains_key(n))
            .collect();
        unseen.sort();
        unseen.dedup();
        if unseen.is_empty() {
            return Ok(());
        }
        let mut next = self.name_to_id.len();
        for name in unseen {
            self.name_to_id.insert(name, format!("S{next:04}"));
            next += 1;
        }
        self.save()
    }

    fn save(&self) -> CoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| CoreError::InputDefect(format!("station map: {e}")))?;
        writer
            .write_record(["station_id", "name"])
            .map_err(|e| CoreError::InputDefect(format!("station map: {e}")))?;
        // write in id order so the file stays append-only in spirit
        let mut rows: Vec<(&String, &String)> =
            self.name_to_id.iter().map(|(n, id)| (id, n)).collect();
        rows.sort();
        for (id, name) in rows {
            writer
                .write_record([id.as_str(), name.as_str()])
                .map_err(|e| CoreError::InputDefect(format!("station map: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| CoreError::InputDefect(format!("station map: {e}")))?;
        Ok(())
    }
}

/// Per-run defect report; the normaliser recovers locally and only fails
/// when every row is defective.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub skipped: Vec<(usize, String)>,
}

struct ParsedRow {
    index: usize,
    train_id: String,
    station_id: String,
    stop_seq: Option<u32>,
    times: [Option<DateTime<Utc>>; 4],
    zero_placeholder: [bool; 4],
    priority: u32,
    class: TrainClass,
}

pub fn to_train_events(
    raw_records: &[RawEventRecord],
    station_map: &mut StationNameMap,
) -> CoreResult<(NormalizedEvents, NormalizeReport)> {
    let records: Vec<RawEventRecord> = raw_records.iter().map(rename_record).collect();
    let service_date = establish_service_date(&records)?;

    // Assign station ids for name-only records up front.
    let names: Vec<String> = records
        .iter()
        .filter(|r| !r.contains_key("station_id"))
        .filter_map(|r| r.get("station_name").map(|n| n.trim().to_string()))
        .collect();
    station_map.ensure(names)?;

    let mut report = NormalizeReport {
        rows_in: raw_records.len(),
        ..Default::default()
    };

    let mut rows: Vec<ParsedRow> = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        match parse_row(index, record, service_date, station_map) {
            Ok(row) => rows.push(row),
            Err(reason) => {
                debug!(row = index, %reason, "skipping defective event row");
                report.skipped.push((index, reason));
            }
        }
    }
    if rows.is_empty() {
        return Err(CoreError::InputDefect(format!(
            "all {} rows defective",
            report.rows_in
        )));
    }

    // Group per train preserving input order within the group.
    let mut by_train: BTreeMap<String, Vec<ParsedRow>> = BTreeMap::new();
    for row in rows {
        by_train.entry(row.train_id.clone()).or_default().push(row);
    }

    let mut events: Vec<TrainEvent> = Vec::new();
    for (_, mut group) in by_train {
        order_group(&mut group);
        null_placeholders(&mut group);
        roll_over_midnight(&mut group);
        for row in group {
            let [sched_arr, sched_dep, act_arr, act_dep] = row.times;
            if let (Some(arr), Some(dep)) = (sched_arr, sched_dep) {
                if dep < arr {
                    warn!(
                        train = %row.train_id,
                        station = %row.station_id,
                        "scheduled departure precedes arrival, dropping row"
                    );
                    report.skipped.push((row.index, "sched_dep < sched_arr".to_string()));
                    continue;
                }
            }
            if let (Some(arr), Some(dep)) = (act_arr, act_dep) {
                if dep < arr {
                    report.skipped.push((row.index, "act_dep < act_arr".to_string()));
                    continue;
                }
            }
            events.push(TrainEvent {
                train_id: row.train_id,
                station_id: row.station_id,
                service_date,
                stop_seq: row.stop_seq,
                sched_arr,
                sched_dep,
                act_arr,
                act_dep,
                priority: row.priority,
                class: row.class,
            });
        }
    }
    report.rows_out = events.len();

    Ok((
        NormalizedEvents {
            schema_version: SCHEMA_VERSION,
            service_date,
            events,
        },
        report,
    ))
}

fn parse_row(
    index: usize,
    record: &RawEventRecord,
    service_date: NaiveDate,
    station_map: &StationNameMap,
) -> Result<ParsedRow, String> {
    let train_id = record
        .get("train_id")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "missing train_id".to_string())?;

    let station_id = match record.get("station_id").map(|v| v.trim()) {
        Some(code) if !code.is_empty() => code.to_string(),
        _ => {
            let name = record
                .get("station_name")
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| "missing station identifier".to_string())?;
            station_map
                .get(name)
                .ok_or_else(|| format!("unmapped station name '{name}'"))?
                .to_string()
        }
    };

    let mut times = [None; 4];
    let mut zero_placeholder = [false; 4];
    for (slot, col) in TIME_COLUMNS.iter().enumerate() {
        if let Some(raw) = record.get(*col) {
            if is_zero_placeholder(raw) {
                zero_placeholder[slot] = true;
            }
            let parsed = parse_time_cell(raw, service_date);
            if parsed.is_none() && !raw.trim().is_empty() {
                return Err(format!("unparseable timestamp '{}' in {col}", raw.trim()));
            }
            times[slot] = parsed;
        }
    }

    let stop_seq = record
        .get("stop_seq")
        .and_then(|v| v.trim().parse::<u32>().ok());
    let priority = record
        .get("priority")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let class = record
        .get("class")
        .map(|v| TrainClass::from_name(v))
        .or_else(|| record.get("train_name").map(|v| TrainClass::from_name(v)))
        .unwrap_or_else(|| TrainClass::from_name(&train_id));

    Ok(ParsedRow {
        index,
        train_id,
        station_id,
        stop_seq,
        times,
        zero_placeholder,
        priority,
        class,
    })
}

/// Sort a train group by stop_seq when present, else by earliest time, with
/// station_id as the final tiebreak.
fn order_group(group: &mut [ParsedRow]) {
    let has_seq = group.iter().any(|r| r.stop_seq.is_some());
    if has_seq {
        group.sort_by(|a, b| {
            a.stop_seq
                .unwrap_or(u32::MAX)
                .cmp(&b.stop_seq.unwrap_or(u32::MAX))
                .then_with(|| a.station_id.cmp(&b.station_id))
        });
    } else {
        group.sort_by(|a, b| {
            let ta = earliest_of(a);
            let tb = earliest_of(b);
            ta.cmp(&tb).then_with(|| a.station_id.cmp(&b.station_id))
        });
    }
}

fn earliest_of(row: &ParsedRow) -> DateTime<Utc> {
    row.times
        .iter()
        .flatten()
        .min()
        .copied()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Zero-time strings at the first and last stop are timetable placeholders
/// (origin has no arrival, terminus no departure), not real midnights.
fn null_placeholders(group: &mut [ParsedRow]) {
    let len = group.len();
    if len == 0 {
        return;
    }
    for slot in 0..4 {
        if group[0].zero_placeholder[slot] {
            group[0].times[slot] = None;
        }
        if group[len - 1].zero_placeholder[slot] {
            group[len - 1].times[slot] = None;
        }
    }
}

/// Cumulative midnight rollover: whenever a stop's reference time precedes
/// the previous stop's, push that stop and all later stops forward by whole
/// days until the sequence is monotonic.
fn roll_over_midnight(group: &mut [ParsedRow]) {
    let mut offset = Duration::zero();
    let mut prev: Option<DateTime<Utc>> = None;
    for row in group.iter_mut() {
        for t in row.times.iter_mut().flatten() {
            *t += offset;
        }
        let mut reference = match reference_of(row) {
            Some(t) => t,
            None => continue,
        };
        if let Some(prev_t) = prev {
            while reference < prev_t {
                for t in row.times.iter_mut().flatten() {
                    *t += Duration::days(1);
                }
                offset += Duration::days(1);
                reference += Duration::days(1);
            }
        }
        prev = Some(reference);
    }
}

fn reference_of(row: &ParsedRow) -> Option<DateTime<Utc>> {
    // prefer departures over arrivals, actual over scheduled
    row.times[3]
        .or(row.times[1])
        .or(row.times[2])
        .or(row.times[0])
}

/// Load raw rows from a CSV file with a header line.
pub fn load_raw_csv(path: impl AsRef<Path>) -> CoreResult<Vec<RawEventRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CoreError::MissingArtifact(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| CoreError::InputDefect(format!("csv open: {e}")))?;
    let headers = reader
        .headers()
        .map_err(|e| CoreError::InputDefect(format!("csv headers: {e}")))?
        .clone();
    let mut out = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| CoreError::InputDefect(format!("csv row: {e}")))?;
        let mut record = RawEventRecord::new();
        for (header, value) in headers.iter().zip(row.iter()) {
            record.insert(header.to_string(), value.to_string());
        }
        out.push(record);
    }
    Ok(out)
}

/// Re-normalising already-normalised events must be a fixpoint; this adapter
/// renders a `TrainEvent` back into the raw shape to make that testable.
pub fn raw_from_event(event: &TrainEvent) -> RawEventRecord {
    let mut record = RawEventRecord::new();
    record.insert("train_id".to_string(), event.train_id.clone());
    record.insert("station_id".to_string(), event.station_id.clone());
    record.insert("day".to_string(), event.service_date.format("%Y-%m-%d").to_string());
    if let Some(seq) = event.stop_seq {
        record.insert("stop_seq".to_string(), seq.to_string());
    }
    record.insert("priority".to_string(), event.priority.to_string());
    record.insert("class".to_string(), event.class.as_str().to_string());
    let fmt = |t: DateTime<Utc>| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    if let Some(t) = event.sched_arr {
        record.insert("sched_arr".to_string(), fmt(t));
    }
    if let Some(t) = event.sched_dep {
        record.insert("sched_dep".to_string(), fmt(t));
    }
    if let Some(t) = event.act_arr {
        record.insert("act_arr".to_string(), fmt(t));
    }
    if let Some(t) = event.act_dep {
        record.insert("act_dep".to_string(), fmt(t));
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> RawEventRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_column_mapping_case_and_whitespace_insensitive() {
        assert_eq!(canonical_column("  Scheduled Arrival "), Some("sched_arr"));
        assert_eq!(canonical_column("TRAIN_NO"), Some("train_id"));
        assert_eq!(canonical_column("bogus_column"), None);
    }

    #[test]
    fn test_midnight_rollover_s3() {
        let rows = vec![
            record(&[
                ("train_id", "T1"),
                ("station_id", "S1"),
                ("stop_seq", "1"),
                ("day", "2024-01-01"),
                ("sched_dep", "23:50"),
            ]),
            record(&[
                ("train_id", "T1"),
                ("station_id", "S2"),
                ("stop_seq", "2"),
                ("sched_arr", "00:05"),
                ("sched_dep", "00:07"),
            ]),
            record(&[
                ("train_id", "T1"),
                ("station_id", "S3"),
                ("stop_seq", "3"),
                ("sched_arr", "00:20"),
            ]),
        ];
        let mut map = StationNameMap::in_memory();
        let (normalized, report) = to_train_events(&rows, &mut map).unwrap();
        assert_eq!(report.rows_out, 3);
        let events = &normalized.events;
        assert_eq!(
            events[0].sched_dep.unwrap().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2024-01-01T23:50:00Z"
        );
        assert_eq!(
            events[1].sched_arr.unwrap().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2024-01-02T00:05:00Z"
        );
        assert_eq!(
            events[2].sched_arr.unwrap().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2024-01-02T00:20:00Z"
        );
    }

    #[test]
    fn test_zero_placeholder_nulled_at_endpoints_only() {
        let rows = vec![
            record(&[
                ("train_id", "T1"),
                ("station_id", "S1"),
                ("stop_seq", "1"),
                ("day", "2024-01-01"),
                ("sched_arr", "00:00"),
                ("sched_dep", "08:00"),
            ]),
            record(&[
                ("train_id", "T1"),
                ("station_id", "S2"),
                ("stop_seq", "2"),
                ("sched_arr", "09:00"),
                ("sched_dep", "09:05"),
            ]),
            record(&[
                ("train_id", "T1"),
                ("station_id", "S3"),
                ("stop_seq", "3"),
                ("sched_arr", "10:00"),
                ("sched_dep", "00:00:00"),
            ]),
        ];
        let mut map = StationNameMap::in_memory();
        let (normalized, _) = to_train_events(&rows, &mut map).unwrap();
        assert!(normalized.events[0].sched_arr.is_none());
        assert!(normalized.events[0].sched_dep.is_some());
        assert!(normalized.events[2].sched_dep.is_none());
        assert!(normalized.events[1].sched_arr.is_some());
    }

    #[test]
    fn test_station_name_mapping_is_stable() {
        let rows1 = vec![record(&[
            ("train_id", "T1"),
            ("station", "Alpha Junction"),
            ("day", "2024-01-01"),
            ("sched_dep", "08:00"),
        ])];
        let mut map = StationNameMap::in_memory();
        let (n1, _) = to_train_events(&rows1, &mut map).unwrap();
        let first_id = n1.events[0].station_id.clone();

        let rows2 = vec![
            record(&[
                ("train_id", "T2"),
                ("station", "Beta Town"),
                ("day", "2024-01-01"),
                ("sched_dep", "09:00"),
            ]),
            record(&[
                ("train_id", "T2"),
                ("station", "Alpha Junction"),
                ("day", "2024-01-01"),
                ("sched_arr", "10:00"),
            ]),
        ];
        let (n2, _) = to_train_events(&rows2, &mut map).unwrap();
        let alpha_again = n2
            .events
            .iter()
            .find(|e| e.station_id == first_id)
            .expect("prior allocation preserved");
        assert_eq!(alpha_again.station_id, first_id);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_missing_service_date() {
        let rows = vec![record(&[
            ("train_id", "T1"),
            ("station_id", "S1"),
            ("sched_dep", "08:00"),
        ])];
        let mut map = StationNameMap::in_memory();
        let err = to_train_events(&rows, &mut map).unwrap_err();
        assert!(matches!(err, CoreError::MissingServiceDate));
    }

    #[test]
    fn test_service_date_derived_from_full_timestamp() {
        let rows = vec![record(&[
            ("train_id", "T1"),
            ("station_id", "S1"),
            ("sched_dep", "2024-03-05T08:00:00Z"),
        ])];
        let mut map = StationNameMap::in_memory();
        let (normalized, _) = to_train_events(&rows, &mut map).unwrap();
        assert_eq!(
            normalized.service_date,
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let rows = vec![
            record(&[
                ("train_id", "T1"),
                ("station_id", "S1"),
                ("stop_seq", "1"),
                ("day", "2024-01-01"),
                ("sched_dep", "23:50"),
            ]),
            record(&[
                ("train_id", "T1"),
                ("station_id", "S2"),
                ("stop_seq", "2"),
                ("sched_arr", "00:05"),
            ]),
        ];
        let mut map = StationNameMap::in_memory();
        let (first, _) = to_train_events(&rows, &mut map).unwrap();
        let raw_again: Vec<RawEventRecord> = first.events.iter().map(raw_from_event).collect();
        let (second, _) = to_train_events(&raw_again, &mut map).unwrap();
        assert_eq!(first.events, second.events);
    }

    #[test]
    fn test_defective_rows_skipped_not_fatal() {
        let rows = vec![
            record(&[
                ("train_id", "T1"),
                ("station_id", "S1"),
                ("day", "2024-01-01"),
                ("sched_dep", "08:00"),
            ]),
            record(&[
                ("train_id", "T1"),
                ("station_id", "S2"),
                ("sched_arr", "not-a-time"),
            ]),
        ];
        let mut map = StationNameMap::in_memory();
        let (normalized, report) = to_train_events(&rows, &mut map).unwrap();
        assert_eq!(normalized.events.len(), 1);
        assert_eq!(report.skipped.len(), 1);
    }
}
