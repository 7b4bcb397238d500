//! Persistent correspondence log.
//!
//! One CSV row per accepted observation:
//!
//! ```text
//! sn,local_x,local_y,local_z,global_x,global_y,global_z,ts_local_coords,ts_img_captured,cam0,pt0,cam1,pt1
//! ```
//!
//! Local coordinates are stage micrometres, global coordinates are reticle-frame
//! micrometres rounded to whole micrometres. Pixel columns hold `(x,y)`; absent
//! fields are empty strings.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use probecal_core::{CalibError, CalibResult, Mat4, Pt2, Pt3, Real};
use serde::{Deserialize, Serialize};

/// A stage position together with its triangulated global position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageObservation {
    pub sn: String,
    /// Stage coordinates, µm.
    pub local: Pt3,
    /// Reticle-frame coordinates, µm.
    pub global: Pt3,
    /// Timestamp of the stage reading; empty when unknown.
    #[serde(default)]
    pub ts_local_coords: String,
}

/// One camera's view of the probe tip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraObservation {
    pub camera: String,
    pub pixel: Pt2,
}

/// Optional capture details recorded alongside an observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationDebug {
    pub ts_img_captured: String,
    /// Up to two camera observations, any order.
    pub observations: Vec<CameraObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceRecord {
    pub sn: String,
    pub local: Pt3,
    /// Rounded to whole micrometres.
    pub global: Pt3,
    pub ts_local_coords: String,
    pub ts_img_captured: String,
    /// Sorted by camera id.
    pub observations: Vec<CameraObservation>,
}

impl CorrespondenceRecord {
    pub fn new(obs: &StageObservation, debug: Option<&ObservationDebug>) -> Self {
        let mut observations = debug.map(|d| d.observations.clone()).unwrap_or_default();
        observations.truncate(2);
        observations.sort_by(|a, b| a.camera.cmp(&b.camera));
        Self {
            sn: obs.sn.clone(),
            local: obs.local,
            global: obs.global.map(Real::round),
            ts_local_coords: obs.ts_local_coords.clone(),
            ts_img_captured: debug.map(|d| d.ts_img_captured.clone()).unwrap_or_default(),
            observations,
        }
    }

    /// Global position as whole micrometres.
    pub fn global_key(&self) -> [i64; 3] {
        [
            self.global.x.round() as i64,
            self.global.y.round() as i64,
            self.global.z.round() as i64,
        ]
    }

    fn camera_ids(&self) -> [&str; 2] {
        let id = |i: usize| self.observations.get(i).map_or("", |o| o.camera.as_str());
        [id(0), id(1)]
    }

    /// Split back into the inputs that produce this record, for replay.
    pub fn to_observation(&self) -> (StageObservation, ObservationDebug) {
        (
            StageObservation {
                sn: self.sn.clone(),
                local: self.local,
                global: self.global,
                ts_local_coords: self.ts_local_coords.clone(),
            },
            ObservationDebug {
                ts_img_captured: self.ts_img_captured.clone(),
                observations: self.observations.clone(),
            },
        )
    }

    /// Same probe, same stage reading, same rounded position and same cameras.
    pub fn same_measurement(&self, other: &Self) -> bool {
        self.sn == other.sn
            && self.ts_local_coords == other.ts_local_coords
            && self.global_key() == other.global_key()
            && self.camera_ids() == other.camera_ids()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRow {
    sn: String,
    local_x: Real,
    local_y: Real,
    local_z: Real,
    global_x: Real,
    global_y: Real,
    global_z: Real,
    ts_local_coords: String,
    ts_img_captured: String,
    cam0: String,
    pt0: String,
    cam1: String,
    pt1: String,
}

fn format_pixel(p: &Pt2) -> String {
    format!("({},{})", p.x, p.y)
}

fn parse_pixel(s: &str) -> CalibResult<Pt2> {
    let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
    let mut parts = inner.split(',').map(|v| v.trim().parse::<Real>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(x)), Some(Ok(y)), None) => Ok(Pt2::new(x, y)),
        _ => Err(CalibError::Log(format!("malformed pixel {s:?}"))),
    }
}

impl From<&CorrespondenceRecord> for LogRow {
    fn from(r: &CorrespondenceRecord) -> Self {
        let cam = |i: usize| r.observations.get(i);
        LogRow {
            sn: r.sn.clone(),
            local_x: r.local.x,
            local_y: r.local.y,
            local_z: r.local.z,
            global_x: r.global.x,
            global_y: r.global.y,
            global_z: r.global.z,
            ts_local_coords: r.ts_local_coords.clone(),
            ts_img_captured: r.ts_img_captured.clone(),
            cam0: cam(0).map(|o| o.camera.clone()).unwrap_or_default(),
            pt0: cam(0).map(|o| format_pixel(&o.pixel)).unwrap_or_default(),
            cam1: cam(1).map(|o| o.camera.clone()).unwrap_or_default(),
            pt1: cam(1).map(|o| format_pixel(&o.pixel)).unwrap_or_default(),
        }
    }
}

impl TryFrom<LogRow> for CorrespondenceRecord {
    type Error = CalibError;

    fn try_from(row: LogRow) -> CalibResult<Self> {
        let mut observations = Vec::new();
        for (cam, pt) in [(row.cam0, row.pt0), (row.cam1, row.pt1)] {
            if !cam.is_empty() && !pt.is_empty() {
                observations.push(CameraObservation {
                    camera: cam,
                    pixel: parse_pixel(&pt)?,
                });
            }
        }
        observations.sort_by(|a, b| a.camera.cmp(&b.camera));
        Ok(Self {
            sn: row.sn,
            local: Pt3::new(row.local_x, row.local_y, row.local_z),
            global: Pt3::new(row.global_x, row.global_y, row.global_z).map(Real::round),
            ts_local_coords: row.ts_local_coords,
            ts_img_captured: row.ts_img_captured,
            observations,
        })
    }
}

const LOG_HEADER: [&str; 13] = [
    "sn",
    "local_x",
    "local_y",
    "local_z",
    "global_x",
    "global_y",
    "global_z",
    "ts_local_coords",
    "ts_img_captured",
    "cam0",
    "pt0",
    "cam1",
    "pt1",
];

fn csv_err(e: csv::Error) -> CalibError {
    CalibError::Log(e.to_string())
}

fn row_writer<W: std::io::Write>(inner: W, with_header: bool) -> CalibResult<csv::Writer<W>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(inner);
    if with_header {
        writer.write_record(LOG_HEADER).map_err(csv_err)?;
    }
    Ok(writer)
}

/// Write `records` to a fresh CSV file at `path`, with header.
pub fn write_records<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a CorrespondenceRecord>,
) -> CalibResult<()> {
    let mut writer = row_writer(fs::File::create(path)?, true)?;
    for r in records {
        writer.serialize(LogRow::from(r)).map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every record of a CSV log.
pub fn read_records(path: &Path) -> CalibResult<Vec<CorrespondenceRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;
    let mut records = Vec::new();
    for row in reader.deserialize::<LogRow>() {
        records.push(CorrespondenceRecord::try_from(row.map_err(csv_err)?)?);
    }
    Ok(records)
}

#[derive(Debug, Serialize, Deserialize)]
struct TransformRow {
    #[serde(rename = "R_0_0")]
    r00: Real,
    #[serde(rename = "R_0_1")]
    r01: Real,
    #[serde(rename = "R_0_2")]
    r02: Real,
    #[serde(rename = "R_1_0")]
    r10: Real,
    #[serde(rename = "R_1_1")]
    r11: Real,
    #[serde(rename = "R_1_2")]
    r12: Real,
    #[serde(rename = "R_2_0")]
    r20: Real,
    #[serde(rename = "R_2_1")]
    r21: Real,
    #[serde(rename = "R_2_2")]
    r22: Real,
    #[serde(rename = "T_0")]
    t0: Real,
    #[serde(rename = "T_1")]
    t1: Real,
    #[serde(rename = "T_2")]
    t2: Real,
    avg_err: Real,
}

/// Write a fitted local-to-global transform as a one-row CSV.
pub fn write_transform(path: &Path, transform: &Mat4, avg_err: Real) -> CalibResult<()> {
    let m = transform;
    let row = TransformRow {
        r00: m[(0, 0)],
        r01: m[(0, 1)],
        r02: m[(0, 2)],
        r10: m[(1, 0)],
        r11: m[(1, 1)],
        r12: m[(1, 2)],
        r20: m[(2, 0)],
        r21: m[(2, 1)],
        r22: m[(2, 2)],
        t0: m[(0, 3)],
        t1: m[(1, 3)],
        t2: m[(2, 3)],
        avg_err,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer.serialize(row).map_err(csv_err)?;
    writer.flush()?;
    Ok(())
}

/// Read a transform written by [`write_transform`].
pub fn read_transform(path: &Path) -> CalibResult<(Mat4, Real)> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let row: TransformRow = reader
        .deserialize::<TransformRow>()
        .next()
        .ok_or_else(|| CalibError::Log(format!("{} has no transform row", path.display())))?
        .map_err(csv_err)?;
    #[rustfmt::skip]
    let m = Mat4::new(
        row.r00, row.r01, row.r02, row.t0,
        row.r10, row.r11, row.r12, row.t1,
        row.r20, row.r21, row.r22, row.t2,
        0.0, 0.0, 0.0, 1.0,
    );
    Ok((m, row.avg_err))
}

/// Identity of a record within one [`CorrespondenceLog`], in append order.
///
/// Ids are never reused, so an id taken before [`CorrespondenceLog::clear`]
/// never names a later record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

/// All records ever accepted, mirrored to a CSV file when a path is set.
#[derive(Debug, Default)]
pub struct CorrespondenceLog {
    path: Option<PathBuf>,
    entries: Vec<(RecordId, CorrespondenceRecord)>,
    next_id: u64,
}

impl CorrespondenceLog {
    /// A log that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the log at `path`, loading existing rows or creating the file
    /// with just its header.
    pub fn open(path: impl Into<PathBuf>) -> CalibResult<Self> {
        let path = path.into();
        let records = if path.exists() && fs::metadata(&path)?.len() > 0 {
            read_records(&path)?
        } else {
            write_records(&path, std::iter::empty())?;
            Vec::new()
        };
        log::debug!("opened {} with {} records", path.display(), records.len());
        let mut log = Self {
            path: Some(path),
            ..Self::default()
        };
        for record in records {
            log.push(record);
        }
        Ok(log)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &CorrespondenceRecord> + '_ {
        self.entries.iter().map(|(_, r)| r)
    }

    pub fn records_for<'a>(
        &'a self,
        sn: &str,
    ) -> impl Iterator<Item = (RecordId, &'a CorrespondenceRecord)> + 'a {
        let sn = sn.to_owned();
        self.entries
            .iter()
            .filter(move |(_, r)| r.sn == sn)
            .map(|(id, r)| (*id, r))
    }

    /// The record with `id`, unless it was cleared.
    pub fn get(&self, id: RecordId) -> Option<&CorrespondenceRecord> {
        self.entries
            .binary_search_by_key(&id, |(id, _)| *id)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Whether `record` repeats a measurement already logged.
    ///
    /// Only the trailing run of rows sharing its local timestamp is examined.
    pub fn is_duplicate(&self, record: &CorrespondenceRecord) -> bool {
        for (_, row) in self.entries.iter().rev() {
            if row.same_measurement(record) {
                return true;
            }
            if row.ts_local_coords != record.ts_local_coords {
                break;
            }
        }
        false
    }

    pub fn append(&mut self, record: CorrespondenceRecord) -> CalibResult<RecordId> {
        if let Some(path) = &self.path {
            let file = OpenOptions::new().append(true).create(true).open(path)?;
            let empty = file.metadata()?.len() == 0;
            let mut writer = row_writer(file, empty)?;
            writer.serialize(LogRow::from(&record)).map_err(csv_err)?;
            writer.flush()?;
        }
        Ok(self.push(record))
    }

    fn push(&mut self, record: CorrespondenceRecord) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, record));
        id
    }

    /// Remove one probe's rows, or every row when `sn` is `None`.
    pub fn clear(&mut self, sn: Option<&str>) -> CalibResult<()> {
        match sn {
            Some(sn) => self.entries.retain(|(_, r)| r.sn != sn),
            None => self.entries.clear(),
        }
        if let Some(path) = &self.path {
            write_records(path, self.records())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(sn: &str, ts: &str, global: [Real; 3]) -> StageObservation {
        StageObservation {
            sn: sn.to_string(),
            local: Pt3::new(100.0, 200.0, 300.0),
            global: Pt3::from(global),
            ts_local_coords: ts.to_string(),
        }
    }

    fn debug(cams: &[(&str, Real, Real)]) -> ObservationDebug {
        ObservationDebug {
            ts_img_captured: "12:00:00.5".to_string(),
            observations: cams
                .iter()
                .map(|(c, x, y)| CameraObservation {
                    camera: c.to_string(),
                    pixel: Pt2::new(*x, *y),
                })
                .collect(),
        }
    }

    #[test]
    fn record_rounds_and_sorts() {
        let d = debug(&[("camB", 1.0, 2.0), ("camA", 3.5, 4.25)]);
        let r = CorrespondenceRecord::new(&obs("SN1", "t0", [10.4, -3.6, 0.5]), Some(&d));
        assert_eq!(r.global_key(), [10, -4, 1]);
        assert_eq!(r.observations[0].camera, "camA");
        assert_eq!(r.observations[1].camera, "camB");
    }

    #[test]
    fn csv_roundtrip_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.csv");

        let d = debug(&[("cam1", 1000.5, 2000.25), ("cam0", 10.0, 20.0)]);
        {
            let mut log = CorrespondenceLog::open(&path).unwrap();
            log.append(CorrespondenceRecord::new(&obs("SN1", "t0", [1.2, 2.6, 3.0]), Some(&d)))
                .unwrap();
            log.append(CorrespondenceRecord::new(&obs("SN2", "", [5.0, 6.0, 7.0]), None))
                .unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "sn,local_x,local_y,local_z,global_x,global_y,global_z,ts_local_coords,ts_img_captured,cam0,pt0,cam1,pt1"
        );
        assert!(text.contains("\"(10,20)\""), "{text}");

        let log = CorrespondenceLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        let records: Vec<_> = log.records().collect();
        assert_eq!(records[0].global_key(), [1, 3, 3]);
        assert_eq!(records[0].observations[1].pixel, Pt2::new(1000.5, 2000.25));
        assert!(records[1].observations.is_empty());
        assert_eq!(records[1].ts_img_captured, "");
    }

    #[test]
    fn duplicates_are_found_within_timestamp_run() {
        let mut log = CorrespondenceLog::in_memory();
        let d = debug(&[("cam0", 1.0, 1.0), ("cam1", 2.0, 2.0)]);
        let first = CorrespondenceRecord::new(&obs("SN1", "t0", [1.0, 2.0, 3.0]), Some(&d));
        log.append(first.clone()).unwrap();
        log.append(CorrespondenceRecord::new(&obs("SN1", "t0", [9.0, 9.0, 9.0]), Some(&d)))
            .unwrap();

        let again = CorrespondenceRecord::new(&obs("SN1", "t0", [1.3, 2.0, 2.8]), Some(&d));
        assert!(log.is_duplicate(&again));

        let other_cams = debug(&[("cam0", 1.0, 1.0), ("cam2", 2.0, 2.0)]);
        let moved = CorrespondenceRecord::new(&obs("SN1", "t0", [1.0, 2.0, 3.0]), Some(&other_cams));
        assert!(!log.is_duplicate(&moved));

        // a different timestamp ends the backward scan
        log.append(CorrespondenceRecord::new(&obs("SN1", "t1", [0.0, 0.0, 0.0]), None))
            .unwrap();
        assert!(!log.is_duplicate(&again));
    }

    #[test]
    fn clear_by_serial_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.csv");
        let mut log = CorrespondenceLog::open(&path).unwrap();
        for (sn, ts) in [("SN1", "a"), ("SN2", "b"), ("SN1", "c")] {
            log.append(CorrespondenceRecord::new(&obs(sn, ts, [0.0, 0.0, 1.0]), None))
                .unwrap();
        }

        log.clear(Some("SN1")).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(read_records(&path).unwrap().len(), 1);
        assert_eq!(log.records_for("SN2").count(), 1);

        log.clear(None).unwrap();
        assert!(log.is_empty());
        assert!(read_records(&path).unwrap().is_empty());
    }

    #[test]
    fn record_ids_survive_clearing() {
        let mut log = CorrespondenceLog::in_memory();
        let mut ids = Vec::new();
        for (sn, ts) in [("SN1", "a"), ("SN2", "b"), ("SN1", "c")] {
            let record = CorrespondenceRecord::new(&obs(sn, ts, [0.0, 0.0, 1.0]), None);
            ids.push(log.append(record).unwrap());
        }
        assert_eq!(log.get(ids[2]).unwrap().ts_local_coords, "c");

        log.clear(Some("SN1")).unwrap();
        assert!(log.get(ids[0]).is_none());
        assert_eq!(log.get(ids[1]).unwrap().sn, "SN2");

        let later = log
            .append(CorrespondenceRecord::new(&obs("SN1", "d", [0.0, 0.0, 1.0]), None))
            .unwrap();
        assert!(!ids.contains(&later));
        let sn1: Vec<RecordId> = log.records_for("SN1").map(|(id, _)| id).collect();
        assert_eq!(sn1, vec![later]);
    }

    #[test]
    fn transform_export_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transform.csv");
        let mut m = Mat4::identity();
        m[(0, 1)] = -0.25;
        m[(2, 3)] = 1234.5;
        write_transform(&path, &m, 7.5).unwrap();

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("R_0_0,R_0_1,R_0_2,R_1_0"), "{header}");
        assert!(header.lines().next().unwrap().ends_with("T_0,T_1,T_2,avg_err"));

        let (back, err) = read_transform(&path).unwrap();
        assert_eq!(back, m);
        assert_eq!(err, 7.5);
    }
}
