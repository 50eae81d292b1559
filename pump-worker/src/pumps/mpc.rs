//! `MPC` pump: uploads Machine Performance Check results written to a TDS directory.
//!
//! Every check writes a `Results.csv` into a directory named after the machine serial number, the
//! time of the check, the beam and the check template. Results of one machine are grouped by kind of
//! check and, for beam and geometry checks, by time window, so the checks of one session become a
//! single upload. A group is only uploaded once no more results have been written to it for the
//! configured wait time.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime};
use globset::GlobBuilder;
use pump_common::config::{FieldDef, FieldKind, FieldValues, FieldValuesExt, PumpConfig, SectionDef};
use pump_common::error::{PumpError, SourceError};
use pump_common::events::PumpLogger;
use pump_common::grouping::{group_by_key_and_window, settled};
use pump_common::payload::TestValue;
use pump_common::pipeline::{Fetcher, MissingDataRule, RecordPipeline, Transformer};
use pump_common::qatrack::{qatrack_section, QATrackClient, QATrackSettings, QATRACK_SECTION};
use pump_common::registry::{PumpCycle, PumpType};
use pump_common::validation::Validation;
use regex::Regex;
use walkdir::WalkDir;

pub const MPC: &str = "MPC";
pub const MPC_SECTION: &str = "MPC";
pub const TEST_LIST_SECTION: &str = "Test List";

pub const ENHANCED_COUCH_CHECKS: &str = "Enhanced Couch Checks";
pub const ENHANCED_MLC_CHECKS: &str = "Enhanced MLC Checks";
pub const COLLIMATION_DEVICES_CHECKS: &str = "Collimation Devices Checks";
pub const BEAM_AND_GEOMETRY_CHECKS: &str = "Beam and Geometry Checks";

const DIR_DATE_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

static RESULTS_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        .*                                  # preamble like NDS-WKS
        -SN(?P<serial>\w+)
        -(?P<date>\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})
        -(?P<beam_num>\d{4})
        -(?P<template>[a-zA-Z]+)            # e.g. BeamCheckTemplate
        (?P<energy>[\d.]+)                  # 6, 9, 12, 2.5
        (?P<beam_type>[xXeE]+)
        (?P<fff>[fF]+)?
        (?P<hdtse>[HDTSE]+)?
        (?P<mvkv>[MVkV]+)?
        (?P<enhanced>.*)?                   # e.g. EnhancedCouch
        ",
    )
    .unwrap()
});

/// Directory names written by older MPC versions, with the template after the beam.
static RESULTS_DIR_OLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        .*
        -SN(?P<serial>\w+)
        -(?P<date>\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})
        -(?P<beam_num>\d{4})
        -(?P<energy>[\d.]+)
        (?P<beam_type>[xXeE]+)
        (?P<fff>[fF]+)?
        (?P<hdtse>[HDTSE]+)?
        (?P<mvkv>[MVkV]+)?
        -(?P<template>[a-zA-Z]+)            # e.g. Beam or Geometry
        (?P<enhanced>.*)?
        ",
    )
    .unwrap()
});

static CHECK_TYPE_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*check_type\s*\}\}").unwrap());

/// Individual leaf results, too many to upload.
const EXCLUDED_TESTS: [&str; 12] = [
    "CollimationGroup/MLCGroup/MLCLeavesA/MLCLeaf",
    "CollimationGroup/MLCGroup/MLCLeavesB/MLCLeaf",
    "CollimationGroup/MLCBacklashGroup/MLCBacklashLeavesA/MLCBacklashLeaf",
    "CollimationGroup/MLCBacklashGroup/MLCBacklashLeavesB/MLCBacklashLeaf",
    "CollimationDevicesGroup/MLCGroup/MLCPosition0/MLCLeavesA/MLCLeaf",
    "CollimationDevicesGroup/MLCGroup/MLCPosition0/MLCLeavesB/MLCLeaf",
    "CollimationDevicesGroup/MLCGroup/MLCPosition1/MLCLeavesA/MLCLeaf",
    "CollimationDevicesGroup/MLCGroup/MLCPosition1/MLCLeavesB/MLCLeaf",
    "CollimationDevicesGroup/MLCGroup/MLCPosition2/MLCLeavesA/MLCLeaf",
    "CollimationDevicesGroup/MLCGroup/MLCPosition2/MLCLeavesB/MLCLeaf",
    "CollimationDevicesGroup/MLCBacklashGroup/MLCBacklashLeavesA/MLCBacklashLeaf",
    "CollimationDevicesGroup/MLCBacklashGroup/MLCBacklashLeavesB/MLCBacklashLeaf",
];

pub struct Mpc {
    timeout: Duration,
    missing_data: MissingDataRule,
}

impl Mpc {
    pub fn new(timeout: Duration, missing_data: MissingDataRule) -> Self {
        Self {
            timeout,
            missing_data,
        }
    }
}

impl PumpType for Mpc {
    fn name(&self) -> &str {
        MPC
    }

    fn sections(&self) -> Vec<SectionDef> {
        vec![
            SectionDef::new(MPC_SECTION)
                .field(
                    FieldDef::new("tds directory", FieldKind::Directory)
                        .required()
                        .help("The TDS directory, e.g. I:\\TDS or \\\\YOURSERVER\\VA_Transfer\\TDS"),
                )
                .field(
                    FieldDef::new("fast search", FieldKind::Bool)
                        .default(true)
                        .help("Only search the MPCChecks subdirectories for results"),
                )
                .field(
                    FieldDef::new("history days", FieldKind::Int)
                        .default(1)
                        .range(0.0, 3650.0)
                        .help("Number of prior days to look for results in"),
                )
                .field(
                    FieldDef::new("grouping window", FieldKind::Int)
                        .required()
                        .default(20)
                        .range(0.0, 1440.0)
                        .help("Minutes within which beam and geometry results are grouped together"),
                )
                .field(
                    FieldDef::new("wait time", FieldKind::Int)
                        .required()
                        .default(20)
                        .range(0.0, 1440.0)
                        .help("Minutes to wait for more results before uploading a group"),
                )
                .field(
                    FieldDef::new("include comment", FieldKind::Bool)
                        .default(true)
                        .help("Add the threshold and result of each test as a comment"),
                )
                .blocking_validator(check_mpc),
            qatrack_section(self.timeout),
            SectionDef::new(TEST_LIST_SECTION)
                .depends_on(QATRACK_SECTION)
                .field(
                    FieldDef::new("name", FieldKind::String)
                        .required()
                        .default("MPC: {{ check_type }}")
                        .help("Template of the Test List name results are uploaded to"),
                )
                .blocking_validator(check_test_list),
        ]
    }

    fn build_cycle(
        &self,
        config: &PumpConfig,
        logger: PumpLogger,
    ) -> Result<Box<dyn PumpCycle>, PumpError> {
        let settings = QATrackSettings::from_values(
            &config
                .values(QATRACK_SECTION)
                .first()
                .cloned()
                .unwrap_or_default(),
        );
        let mut options = settings.pipeline_options(self.missing_data.clone());
        // Results of checks not part of a test list are always skipped.
        options.autoskip = true;
        let client = Arc::new(QATrackClient::new(settings, self.timeout)?);

        let source = Arc::new(MpcSource {
            logger: logger.clone(),
            settings: MpcSettings::from_values(
                &config.values(MPC_SECTION).first().cloned().unwrap_or_default(),
            ),
            test_list: config.str_value(TEST_LIST_SECTION, "name").to_owned(),
            client: client.clone(),
            units: Mutex::new(HashMap::new()),
        });

        Ok(Box::new(RecordPipeline::new(
            logger,
            source.clone(),
            source,
            client,
            options,
        )))
    }
}

fn check_mpc(values: &[FieldValues]) -> Validation {
    let Some(values) = values.first() else {
        return Validation::invalid("No MPC settings");
    };

    let tds = values.str_field("tds directory").trim();
    if tds.is_empty() {
        return Validation::invalid("You must set a source TDS directory");
    }
    if !tds_path(tds).is_dir() {
        return Validation::invalid(format!("{tds} is not a valid directory"));
    }
    Validation::ok()
}

fn check_test_list(values: &[FieldValues]) -> Validation {
    let name = values
        .first()
        .map(|values| values.str_field("name"))
        .unwrap_or_default();
    if !CHECK_TYPE_VARIABLE.is_match(name) {
        return Validation::invalid(
            "You must include a '{{ check_type }}' template variable in your test list name",
        );
    }
    Validation::ok()
}

fn tds_path(tds: &str) -> PathBuf {
    PathBuf::from(tds.trim().replace('\\', "/"))
}

/// Test slug of a result: lower case, every run of other characters than letters and digits
/// replaced by an underscore.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Kind of check a results directory belongs to. Results of different kinds go to different test
/// lists.
pub fn check_type(dir_name: &str) -> &'static str {
    let has = |word: &str| dir_name.contains(word);
    if has("Enhanced") && has("Couch") {
        ENHANCED_COUCH_CHECKS
    } else if has("Enhanced") && has("MLC") {
        ENHANCED_MLC_CHECKS
    } else if has("Collimation") && has("Devices") {
        COLLIMATION_DEVICES_CHECKS
    } else {
        BEAM_AND_GEOMETRY_CHECKS
    }
}

#[derive(Debug, Clone)]
struct MpcSettings {
    tds: PathBuf,
    fast_search: bool,
    history_days: i64,
    grouping_window: u32,
    wait_minutes: i64,
    include_comment: bool,
}

impl MpcSettings {
    fn from_values(values: &FieldValues) -> Self {
        Self {
            tds: tds_path(values.str_field("tds directory")),
            fast_search: values.bool_field("fast search").unwrap_or(true),
            history_days: values.i64_field("history days").unwrap_or(1).max(0),
            grouping_window: values
                .i64_field("grouping window")
                .and_then(|minutes| u32::try_from(minutes).ok())
                .unwrap_or(20),
            wait_minutes: values.i64_field("wait time").unwrap_or(20).max(0),
            include_comment: values.bool_field("include comment").unwrap_or(true),
        }
    }

    fn glob(&self) -> &'static str {
        match self.fast_search {
            true => "*/MPCChecks/**/*.csv",
            false => "**/Results.csv",
        }
    }

    /// Files last modified before midnight `history days` ago are ignored.
    fn cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        now.date().and_time(NaiveTime::MIN) - chrono::Duration::days(self.history_days)
    }
}

/// What the name of a results directory tells about the check.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsDir {
    pub path: PathBuf,
    pub serial: String,
    pub date: NaiveDateTime,
    pub energy: String,
    pub beam_type: String,
    pub check_type: &'static str,
}

impl ResultsDir {
    /// Parse the name of the directory `path` is in. `None` unless it is named like a results
    /// directory.
    pub fn parse(path: &Path) -> Option<Self> {
        let dir_name = path.parent()?.file_name()?.to_str()?;
        let captures = RESULTS_DIR
            .captures(dir_name)
            .or_else(|| RESULTS_DIR_OLD.captures(dir_name))?;
        let group = |name: &str| captures.name(name).map_or("", |m| m.as_str());

        let beam_type = if !group("fff").is_empty() {
            "FFF".to_owned()
        } else if !group("hdtse").is_empty() {
            "HDTSE".to_owned()
        } else {
            group("beam_type").to_uppercase()
        };

        Some(Self {
            path: path.to_path_buf(),
            serial: group("serial").to_owned(),
            date: NaiveDateTime::parse_from_str(group("date"), DIR_DATE_FORMAT).ok()?,
            energy: group("energy").to_owned(),
            beam_type,
            check_type: check_type(dir_name),
        })
    }

    fn beam(&self) -> String {
        format!("{}{}", self.energy, self.beam_type)
    }
}

/// One result row of a `Results.csv`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub test: String,
    pub value: f64,
    pub threshold: f64,
    pub result: String,
}

/// Read the result rows of a `Results.csv`, skipping excluded tests.
pub fn read_results(path: &Path) -> Result<Vec<ResultRow>, SourceError> {
    let malformed = |reason: String| SourceError::Other(format!("{}: {}", path.display(), reason));
    let number = |field: Option<&str>, what: &str| {
        field
            .unwrap_or_default()
            .parse::<f64>()
            .map_err(|e| malformed(format!("invalid {what}: {e}")))
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| malformed(e.to_string()))?;

    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| malformed(e.to_string()))?;
        let test = row.get(0).unwrap_or_default();
        if test.is_empty() || EXCLUDED_TESTS.iter().any(|excluded| test.contains(excluded)) {
            continue;
        }

        rows.push(ResultRow {
            test: test.to_owned(),
            value: number(row.get(1), "value")?,
            threshold: number(row.get(2), "threshold")?,
            result: row.get(3).unwrap_or_default().to_owned(),
        });
    }
    Ok(rows)
}

/// A results file of an upload, with its rows or why they could not be read.
#[derive(Debug, Clone)]
pub struct ResultsFile {
    pub dir: ResultsDir,
    pub rows: Result<Vec<ResultRow>, String>,
}

/// All results of one machine and kind of check within one time window.
#[derive(Debug, Clone)]
pub struct MpcRecord {
    pub serial: String,
    pub check_type: &'static str,
    /// Start of the time window.
    pub label: String,
    pub files: Vec<ResultsFile>,
}

/// Results files below the TDS directory modified since the history cutoff, and the paths of those
/// whose directory name could not be parsed.
fn find_results(
    settings: &MpcSettings,
    now: NaiveDateTime,
) -> Result<(Vec<ResultsDir>, Vec<PathBuf>), SourceError> {
    let glob = GlobBuilder::new(settings.glob())
        .literal_separator(true)
        .build()
        .map_err(|e| SourceError::Other(e.to_string()))?
        .compile_matcher();
    let cutoff = settings.cutoff(now);

    let mut found = Vec::new();
    let mut unparsed = Vec::new();
    for entry in WalkDir::new(&settings.tds).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(SourceError::Io(e.into())),
            Err(e) => {
                tracing::warn!("skipping unreadable entry below {}: {}", settings.tds.display(), e);
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(&settings.tds) else {
            continue;
        };
        if !entry.file_type().is_file() || !glob.is_match(relative) {
            continue;
        }

        let modified = entry
            .metadata()
            .map_err(|e| SourceError::Io(e.into()))?
            .modified()?;
        if DateTime::<Local>::from(modified).naive_local() <= cutoff {
            continue;
        }

        match ResultsDir::parse(entry.path()) {
            Some(dir) => found.push(dir),
            None => unparsed.push(entry.path().to_path_buf()),
        }
    }

    Ok((found, unparsed))
}

/// Group results by machine, kind of check and time window, keeping only settled groups. Only beam
/// and geometry checks of one session are spread over a window, other kinds are grouped by exact
/// time.
pub fn group_results(
    dirs: Vec<ResultsDir>,
    window_minutes: u32,
    wait: chrono::Duration,
    now: NaiveDateTime,
) -> Vec<(String, &'static str, String, Vec<ResultsDir>)> {
    let (windowed, exact): (Vec<_>, Vec<_>) = dirs
        .into_iter()
        .partition(|dir| dir.check_type == BEAM_AND_GEOMETRY_CHECKS);

    let mut groups = Vec::new();
    for (dirs, minutes) in [(windowed, window_minutes), (exact, 0)] {
        let clustered = group_by_key_and_window(
            dirs,
            minutes,
            |dir| (dir.serial.clone(), dir.check_type),
            |dir| dir.date,
        );
        for ((serial, check_type), clusters) in clustered {
            for (label, dirs) in settled(clusters, wait, now, |dir| dir.date) {
                groups.push((serial.clone(), check_type, label, dirs));
            }
        }
    }

    groups.sort_by(|a, b| (&a.0, &a.2, a.1).cmp(&(&b.0, &b.2, b.1)));
    groups
}

fn collect_records(
    settings: &MpcSettings,
    now: NaiveDateTime,
) -> Result<(Vec<MpcRecord>, Vec<PathBuf>), SourceError> {
    let (dirs, unparsed) = find_results(settings, now)?;
    let wait = chrono::Duration::minutes(settings.wait_minutes);

    let records = group_results(dirs, settings.grouping_window, wait, now)
        .into_iter()
        .map(|(serial, check_type, label, dirs)| MpcRecord {
            serial,
            check_type,
            label,
            files: dirs
                .into_iter()
                .map(|dir| ResultsFile {
                    rows: read_results(&dir.path).map_err(|e| e.to_string()),
                    dir,
                })
                .collect(),
        })
        .collect();

    Ok((records, unparsed))
}

struct MpcSource {
    logger: PumpLogger,
    settings: MpcSettings,
    test_list: String,
    client: Arc<QATrackClient>,
    /// Unit name by serial number, listed at the start of every fetch.
    units: Mutex<HashMap<String, String>>,
}

impl MpcSource {
    async fn list_units(&self) -> Result<HashMap<String, String>, SourceError> {
        let units = self
            .client
            .list("units/units")
            .await
            .map_err(|e| SourceError::Other(format!("Failed to list units: {e}")))?;

        Ok(units
            .iter()
            .filter_map(|unit| {
                let serial = unit.get("serial_number")?.as_str()?;
                let name = unit.get("name")?.as_str()?;
                Some((serial.to_owned(), name.to_owned()))
            })
            .collect())
    }
}

#[async_trait]
impl Fetcher<MpcRecord> for MpcSource {
    async fn fetch_records(&self) -> Result<Vec<MpcRecord>, SourceError> {
        let units = self.list_units().await?;
        *self.units.lock().unwrap_or_else(PoisonError::into_inner) = units;

        self.logger
            .debug(format!("Searching {} for results", self.settings.tds.display()));
        let settings = self.settings.clone();
        let now = Local::now().naive_local();
        let (records, unparsed) = tokio::task::spawn_blocking(move || collect_records(&settings, now))
            .await
            .map_err(|e| SourceError::Other(format!("searching for results failed: {e}")))??;

        for path in unparsed {
            self.logger
                .warning(format!("Skipping {}: unrecognized results directory", path.display()));
        }
        Ok(records)
    }
}

impl Transformer<MpcRecord> for MpcSource {
    fn id_for_record(&self, record: &MpcRecord) -> String {
        format!(
            "QCPump/MPC/{}/{}/{}",
            record.serial, record.label, record.check_type
        )
    }

    fn unit_for_record(&self, record: &MpcRecord) -> Option<String> {
        let unit = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record.serial)
            .cloned();
        if unit.is_none() {
            self.logger.error(format!(
                "No QATrack+ Unit found with Serial Number {}",
                record.serial
            ));
        }
        unit
    }

    fn test_list_for_record(&self, record: &MpcRecord) -> String {
        CHECK_TYPE_VARIABLE
            .replace_all(&self.test_list, record.check_type)
            .trim()
            .to_owned()
    }

    fn work_datetimes_for_record(&self, record: &MpcRecord) -> (NaiveDateTime, NaiveDateTime) {
        let dates = record.files.iter().map(|file| file.dir.date);
        let Some(start) = dates.clone().min() else {
            let now = Local::now().naive_local();
            return (now, now);
        };
        let end = dates.max().unwrap_or(start);
        (start, end.max(start + chrono::Duration::minutes(1)))
    }

    fn test_values_from_record(
        &self,
        record: &MpcRecord,
    ) -> Result<BTreeMap<String, TestValue>, SourceError> {
        let mut values = BTreeMap::new();
        for file in &record.files {
            let rows = file.rows.as_ref().map_err(|e| SourceError::Other(e.clone()))?;
            let beam = file.dir.beam();

            for row in rows {
                let mut value = TestValue::new(row.value);
                if self.settings.include_comment {
                    value = value.with_comment(format!(
                        "Threshold: {:.3},Result: {}",
                        row.threshold, row.result
                    ));
                }
                values.insert(slugify(&format!("{}_{}", row.test, beam)), value);
            }
        }
        Ok(values)
    }

    fn comment_for_record(&self, record: &MpcRecord) -> Option<String> {
        let paths: Vec<String> = record
            .files
            .iter()
            .map(|file| file.dir.path.display().to_string())
            .collect();
        Some(format!("Fileset:\n\t{}", paths.join("\n\t")))
    }
}
