//! `File Upload` pumps: every file of a unit's source directory matching the configured file types
//! is uploaded to the upload test of a test list, then optionally moved out of the way. The text
//! variant uploads file contents as text, the binary one base64 encoded.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Local, NaiveDateTime};
use globset::{GlobBuilder, GlobMatcher};
use pump_common::config::{FieldDef, FieldKind, FieldValues, FieldValuesExt, PumpConfig, SectionDef};
use pump_common::error::{ConfigError, PumpError, SourceError};
use pump_common::events::PumpLogger;
use pump_common::payload::TestValue;
use pump_common::pipeline::{Fetcher, MissingDataRule, PostProcessor, RecordPipeline, Transformer};
use pump_common::qatrack::{
    qatrack_section, QATrackChoices, QATrackClient, QATrackSettings, QATRACK_SECTION,
};
use pump_common::registry::{PumpCycle, PumpType};
use pump_common::validation::Validation;
use walkdir::WalkDir;

pub const FILE_UPLOAD: &str = "File Upload";
pub const BINARY_FILE_UPLOAD: &str = "File Upload (Binary)";
pub const DIRECTORY_SECTION: &str = "Directory";
pub const FILE_TYPES_SECTION: &str = "File Types";
pub const TEST_LIST_SECTION: &str = "Test List";

/// How file contents are put into the upload test value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    Text,
    Base64,
}

impl FileEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEncoding::Text => "text",
            FileEncoding::Base64 => "base64",
        }
    }
}

pub struct FileUpload {
    encoding: FileEncoding,
    timeout: Duration,
    missing_data: MissingDataRule,
}

impl FileUpload {
    pub fn new(timeout: Duration, missing_data: MissingDataRule) -> Self {
        Self {
            encoding: FileEncoding::Text,
            timeout,
            missing_data,
        }
    }

    pub fn binary(timeout: Duration, missing_data: MissingDataRule) -> Self {
        Self {
            encoding: FileEncoding::Base64,
            timeout,
            missing_data,
        }
    }
}

impl PumpType for FileUpload {
    fn name(&self) -> &str {
        match self.encoding {
            FileEncoding::Text => FILE_UPLOAD,
            FileEncoding::Base64 => BINARY_FILE_UPLOAD,
        }
    }

    fn sections(&self) -> Vec<SectionDef> {
        vec![
            qatrack_section(self.timeout),
            SectionDef::new(TEST_LIST_SECTION)
                .depends_on(QATRACK_SECTION)
                .field(
                    FieldDef::new("name", FieldKind::String)
                        .required()
                        .help("Name of the Test List to upload files to"),
                )
                .field(
                    FieldDef::new("slug", FieldKind::String)
                        .required()
                        .default("upload")
                        .help("Macro name of the upload test of the Test List"),
                )
                .blocking_validator(check_test_list),
            SectionDef::new(FILE_TYPES_SECTION)
                .field(
                    FieldDef::new("recursive", FieldKind::Bool)
                        .default(false)
                        .help("Include files from subdirectories"),
                )
                .field(
                    FieldDef::new("pattern", FieldKind::String)
                        .required()
                        .default("*")
                        .help("Only upload files matching this glob, e.g. 'output-*.txt'"),
                )
                .field(
                    FieldDef::new("ignore pattern", FieldKind::String)
                        .default("")
                        .help("Never upload files matching this glob. Leave blank to keep every file"),
                )
                .blocking_validator(check_file_types),
            SectionDef::new(DIRECTORY_SECTION)
                .multiple()
                .depends_on(QATRACK_SECTION)
                .field(
                    FieldDef::new("unit name", FieldKind::Choice)
                        .required()
                        .choices_from(QATrackChoices::units(self.timeout))
                        .help("Name of the unit in QATrack+"),
                )
                .field(FieldDef::new("source directory", FieldKind::Directory).required())
                .field(
                    FieldDef::new("processed directory", FieldKind::Directory)
                        .help("Uploaded files are moved here. Leave blank to leave them in place"),
                )
                .blocking_validator(check_directories),
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
        let options = settings.pipeline_options(self.missing_data.clone());
        let client = QATrackClient::new(settings, self.timeout)?;

        let file_types = config
            .values(FILE_TYPES_SECTION)
            .first()
            .cloned()
            .unwrap_or_default();
        let filter = FileFilter::from_values(&file_types).map_err(|e| ConfigError::InvalidValue {
            section: FILE_TYPES_SECTION.to_owned(),
            field: "pattern".to_owned(),
            reason: e.to_string(),
        })?;

        let source = Arc::new(FileSource {
            logger: logger.clone(),
            directories: config
                .values(DIRECTORY_SECTION)
                .iter()
                .map(WatchedDirectory::from_values)
                .collect(),
            filter: Arc::new(filter),
            encoding: self.encoding,
            test_list: config.str_value(TEST_LIST_SECTION, "name").trim().to_owned(),
            slug: config.str_value(TEST_LIST_SECTION, "slug").trim().to_owned(),
        });

        let pipeline = RecordPipeline::new(
            logger,
            source.clone(),
            source.clone(),
            Arc::new(client),
            options,
        )
        .with_post_processor(source);

        Ok(Box::new(pipeline))
    }
}

fn check_test_list(values: &[FieldValues]) -> Validation {
    let Some(values) = values.first() else {
        return Validation::invalid("No Test List settings");
    };

    let mut problems = Vec::new();
    if values.str_field("name").trim().is_empty() {
        problems.push("You must set a test list name");
    }
    if values.str_field("slug").trim().is_empty() {
        problems.push("You must set a test macro name");
    }

    match problems.is_empty() {
        true => Validation::ok(),
        false => Validation::invalid(problems.join("\n")),
    }
}

fn check_file_types(values: &[FieldValues]) -> Validation {
    let Some(values) = values.first() else {
        return Validation::invalid("No File Types settings");
    };
    match FileFilter::from_values(values) {
        Ok(_) => Validation::ok(),
        Err(e) => Validation::invalid(format!("Invalid pattern: {e}")),
    }
}

fn check_directories(values: &[FieldValues]) -> Validation {
    for directory in values.iter().map(WatchedDirectory::from_values) {
        if directory.unit.is_empty() {
            return Validation::invalid("You must set a unit name");
        }
        if directory.source.as_os_str().is_empty() || !directory.source.is_dir() {
            return Validation::invalid("You must set a valid source directory");
        }
    }
    Validation::ok()
}

/// Selects files by their path relative to a source directory.
#[derive(Debug, Clone)]
struct FileFilter {
    recursive: bool,
    include: GlobMatcher,
    ignore: Option<GlobMatcher>,
}

impl FileFilter {
    fn new(pattern: &str, recursive: bool, ignore: &str) -> Result<Self, globset::Error> {
        let pattern = match pattern.trim() {
            "" => "*",
            pattern => pattern,
        };
        let include = match recursive {
            true => format!("**/{pattern}"),
            false => pattern.to_owned(),
        };
        let ignore = match ignore.trim() {
            "" => None,
            ignore => Some(matcher(&format!("**/{ignore}"))?),
        };

        Ok(Self {
            recursive,
            include: matcher(&include)?,
            ignore,
        })
    }

    fn from_values(values: &FieldValues) -> Result<Self, globset::Error> {
        Self::new(
            values.str_field("pattern"),
            values.bool_field("recursive").unwrap_or(false),
            values.str_field("ignore pattern"),
        )
    }

    fn matches(&self, relative: &Path) -> bool {
        self.include.is_match(relative)
            && !self.ignore.as_ref().is_some_and(|ignore| ignore.is_match(relative))
    }

    /// Files below `root` passing the filter, as (path, path relative to `root`, modified time).
    fn walk(&self, root: &Path) -> Result<Vec<(PathBuf, PathBuf, SystemTime)>, SourceError> {
        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut found = Vec::new();

        for entry in WalkDir::new(root).min_depth(1).max_depth(max_depth).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                // The source directory itself is unreadable.
                Err(e) if e.depth() == 0 => return Err(SourceError::Io(e.into())),
                Err(e) => {
                    tracing::warn!("skipping unreadable entry below {}: {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            if !self.matches(relative) {
                continue;
            }

            let modified = entry
                .metadata()
                .map_err(|e| SourceError::Io(e.into()))?
                .modified()?;
            found.push((entry.path().to_path_buf(), relative.to_path_buf(), modified));
        }

        Ok(found)
    }
}

fn matcher(glob: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(glob)
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

#[derive(Debug, Clone)]
struct WatchedDirectory {
    unit: String,
    source: PathBuf,
    processed: Option<PathBuf>,
}

impl WatchedDirectory {
    fn from_values(values: &FieldValues) -> Self {
        let processed = values.str_field("processed directory").trim();
        Self {
            unit: values.str_field("unit name").trim().to_owned(),
            source: PathBuf::from(values.str_field("source directory").trim()),
            processed: (!processed.is_empty()).then(|| PathBuf::from(processed)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub unit: String,
    pub path: PathBuf,
    /// Path relative to the source directory, kept when the file is moved.
    pub relative: PathBuf,
    pub modified: NaiveDateTime,
    pub contents: Vec<u8>,
    pub processed: Option<PathBuf>,
}

impl FileRecord {
    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

struct FileSource {
    logger: PumpLogger,
    directories: Vec<WatchedDirectory>,
    filter: Arc<FileFilter>,
    encoding: FileEncoding,
    test_list: String,
    slug: String,
}

impl FileSource {
    async fn records_in(&self, directory: &WatchedDirectory) -> Result<Vec<FileRecord>, SourceError> {
        let filter = self.filter.clone();
        let root = directory.source.clone();
        let found = tokio::task::spawn_blocking(move || filter.walk(&root))
            .await
            .map_err(|e| SourceError::Other(format!("listing files failed: {e}")))??;

        let mut records = Vec::with_capacity(found.len());
        for (path, relative, modified) in found {
            let contents = match tokio::fs::read(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    self.logger
                        .warning(format!("Skipping {}: {}", path.display(), e));
                    continue;
                }
            };

            records.push(FileRecord {
                unit: directory.unit.clone(),
                modified: DateTime::<Local>::from(modified).naive_local(),
                processed: directory.processed.clone(),
                path,
                relative,
                contents,
            });
        }

        Ok(records)
    }
}

#[async_trait]
impl Fetcher<FileRecord> for FileSource {
    async fn fetch_records(&self) -> Result<Vec<FileRecord>, SourceError> {
        let mut records = Vec::new();
        for directory in &self.directories {
            self.logger
                .debug(format!("Reading files from {}", directory.source.display()));
            records.extend(self.records_in(directory).await?);
        }

        records.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(records)
    }
}

impl Transformer<FileRecord> for FileSource {
    fn id_for_record(&self, record: &FileRecord) -> String {
        format!(
            "QCPump/FileUpload/{}/{}/{}",
            record.unit,
            record.modified.format("%Y-%m-%dT%H:%M:%S%.f"),
            record.stem()
        )
    }

    fn unit_for_record(&self, record: &FileRecord) -> Option<String> {
        (!record.unit.is_empty()).then(|| record.unit.clone())
    }

    fn test_list_for_record(&self, _record: &FileRecord) -> String {
        self.test_list.clone()
    }

    fn work_datetimes_for_record(&self, record: &FileRecord) -> (NaiveDateTime, NaiveDateTime) {
        (record.modified, record.modified)
    }

    fn test_values_from_record(
        &self,
        record: &FileRecord,
    ) -> Result<BTreeMap<String, TestValue>, SourceError> {
        let contents = match self.encoding {
            FileEncoding::Text => String::from_utf8(record.contents.clone()).map_err(|e| {
                SourceError::Other(format!("{} is not a text file: {}", record.path.display(), e))
            })?,
            FileEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(&record.contents),
        };

        Ok(BTreeMap::from([(
            self.slug.clone(),
            TestValue::file(contents, &record.file_name(), self.encoding.as_str()),
        )]))
    }

    fn comment_for_record(&self, record: &FileRecord) -> Option<String> {
        Some(format!("Uploaded from {}", record.relative.display()))
    }
}

#[async_trait]
impl PostProcessor<FileRecord> for FileSource {
    async fn post_process(&self, record: &FileRecord) -> Result<(), SourceError> {
        let Some(processed) = &record.processed else {
            return Ok(());
        };

        let target = processed.join(&record.relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&record.path, &target).await?;

        self.logger.info(format!(
            "Moved {} to {}",
            record.path.display(),
            target.display()
        ));
        Ok(())
    }
}
