//! Settings store
//!
//! A settings file is comma separated text:
//!
//! ```text
//! # comment lines and blank lines are kept in place
//! key,type,encoding,value
//! settings,namespace,,
//! ip_sta,data,string,192.168.50.10
//! wifi_hostname,data,string,drone3
//! ```
//!
//! The first non-comment line is the header. The first column holds the
//! parameter name; the column named `value` (or the second column when
//! there is none) holds its value. Any further columns are carried along
//! untouched. Fields containing commas, quotes or line breaks are double-quoted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use prov_core::{License, ProvisionError, ProvisionResult};
use tracing::debug;

/// Row name of the license unless configured otherwise
pub const DEFAULT_LICENSE_KEY: &str = "dlse_lic";
/// Namespace row required before a license can be embedded
pub const DEFAULT_NAMESPACE: &str = "settings";

const TYPE_COLUMN: &str = "type";
const ENCODING_COLUMN: &str = "encoding";
const VALUE_COLUMN: &str = "value";

/// One parameter row, with one field per header column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRow {
    fields: Vec<String>,
}

impl SettingsRow {
    /// Parameter name
    pub fn name(&self) -> &str {
        &self.fields[0]
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// A line of a settings file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsLine {
    /// Comment or blank line, kept verbatim
    Comment(String),
    Row(SettingsRow),
}

/// Ordered parameter name to value mapping, plus everything else in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    /// Comments and blank lines before the header
    preamble: Vec<String>,
    columns: Vec<String>,
    lines: Vec<SettingsLine>,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self::with_columns(vec![
            "key".to_string(),
            TYPE_COLUMN.to_string(),
            ENCODING_COLUMN.to_string(),
            VALUE_COLUMN.to_string(),
        ])
    }
}

impl SettingsRecord {
    /// Empty record with the given header
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            preamble: Vec::new(),
            columns,
            lines: Vec::new(),
        }
    }

    /// Build a record from raw parts, checking the same invariants as [`Self::parse`]
    pub fn from_parts(
        preamble: Vec<String>,
        columns: Vec<String>,
        lines: Vec<SettingsLine>,
    ) -> ProvisionResult<Self> {
        if columns.len() < 2 {
            return Err(ProvisionError::validation(
                "settings header needs at least a name and a value column",
            ));
        }
        let mut seen = HashSet::new();
        for line in &lines {
            if let SettingsLine::Row(row) = line {
                if row.fields.len() != columns.len() {
                    return Err(ProvisionError::validation(format!(
                        "row '{}' has {} fields, header has {}",
                        row.name(),
                        row.fields.len(),
                        columns.len()
                    )));
                }
                if !seen.insert(row.name().to_string()) {
                    return Err(ProvisionError::validation(format!(
                        "duplicate parameter '{}'",
                        row.name()
                    )));
                }
            }
        }
        Ok(Self {
            preamble,
            columns,
            lines,
        })
    }

    /// Parse settings text
    pub fn parse(text: &str) -> ProvisionResult<Self> {
        let mut preamble = Vec::new();
        let mut columns: Option<Vec<String>> = None;
        let mut lines = Vec::new();
        let mut pending = String::new();
        let mut start_line = 0;

        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            if pending.is_empty() {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    let kept = raw.trim_end_matches(['\n', '\r']).to_string();
                    match columns {
                        None => preamble.push(kept),
                        Some(_) => lines.push(SettingsLine::Comment(kept)),
                    }
                    continue;
                }
                start_line = idx + 1;
            }

            // A quoted field may span lines; the record ends once quotes balance
            pending.push_str(raw);
            if pending.matches('"').count() % 2 == 1 {
                continue;
            }
            let fields = read_fields(&pending)
                .map_err(|e| ProvisionError::validation(format!("line {}: {}", start_line, e)))?;
            pending.clear();

            match &columns {
                None => columns = Some(fields),
                Some(header) => {
                    if fields.len() != header.len() {
                        return Err(ProvisionError::validation(format!(
                            "line {}: expected {} columns, found {}",
                            start_line,
                            header.len(),
                            fields.len()
                        )));
                    }
                    if fields[0].is_empty() {
                        return Err(ProvisionError::validation(format!(
                            "line {}: empty parameter name",
                            start_line
                        )));
                    }
                    lines.push(SettingsLine::Row(SettingsRow { fields }));
                }
            }
        }
        if !pending.is_empty() {
            return Err(ProvisionError::validation(format!(
                "line {}: unterminated quoted field",
                start_line
            )));
        }

        let columns =
            columns.ok_or_else(|| ProvisionError::validation("settings file has no header"))?;
        Self::from_parts(preamble, columns, lines)
    }

    /// Render back to settings text
    pub fn render(&self) -> ProvisionResult<String> {
        let mut out = String::new();
        for comment in &self.preamble {
            out.push_str(comment);
            out.push('\n');
        }
        out.push_str(&write_fields(&self.columns)?);
        for line in &self.lines {
            match line {
                SettingsLine::Comment(c) => {
                    out.push_str(c);
                    out.push('\n');
                }
                SettingsLine::Row(row) => out.push_str(&write_fields(&row.fields)?),
            }
        }
        Ok(out)
    }

    /// Load a settings file
    pub fn load(path: impl AsRef<Path>) -> ProvisionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let record = Self::parse(&text).map_err(|e| match e {
            ProvisionError::Validation(m) => {
                ProvisionError::validation(format!("{}: {}", path.display(), m))
            }
            other => other,
        })?;
        debug!(path = %path.display(), parameters = record.len(), "Loaded settings");
        Ok(record)
    }

    /// Save to a settings file
    pub fn save(&self, path: impl AsRef<Path>) -> ProvisionResult<()> {
        std::fs::write(path.as_ref(), self.render()?)?;
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn preamble(&self) -> &[String] {
        &self.preamble
    }

    pub fn lines(&self) -> &[SettingsLine] {
        &self.lines
    }

    /// Parameter rows in file order
    pub fn rows(&self) -> impl Iterator<Item = &SettingsRow> {
        self.lines.iter().filter_map(|l| match l {
            SettingsLine::Row(r) => Some(r),
            SettingsLine::Comment(_) => None,
        })
    }

    /// Parameter names in file order
    pub fn names(&self) -> Vec<&str> {
        self.rows().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.row(name).is_some()
    }

    pub fn row(&self, name: &str) -> Option<&SettingsRow> {
        self.rows().find(|r| r.name() == name)
    }

    fn row_mut(&mut self, name: &str) -> Option<&mut SettingsRow> {
        self.lines.iter_mut().find_map(|l| match l {
            SettingsLine::Row(r) if r.name() == name => Some(r),
            _ => None,
        })
    }

    fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case(column))
    }

    fn value_index(&self) -> usize {
        self.column_index(VALUE_COLUMN).unwrap_or(1)
    }

    /// Value of a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        let idx = self.value_index();
        self.row(name).map(|r| r.fields[idx].as_str())
    }

    /// Value of a named column for a parameter
    pub fn field(&self, name: &str, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.row(name).map(|r| r.fields[idx].as_str())
    }

    /// Change the value of an existing parameter
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> ProvisionResult<()> {
        let idx = self.value_index();
        let row = self
            .row_mut(name)
            .ok_or_else(|| ProvisionError::validation(format!("parameter '{}' not found", name)))?;
        row.fields[idx] = value.into();
        Ok(())
    }

    /// Set a parameter, appending a new row when it is absent
    ///
    /// `kind` and `encoding` fill the `type` and `encoding` columns when the
    /// header has them.
    pub fn upsert(&mut self, name: &str, kind: &str, encoding: &str, value: impl Into<String>) {
        let value_idx = self.value_index();
        let type_idx = self.column_index(TYPE_COLUMN);
        let encoding_idx = self.column_index(ENCODING_COLUMN);
        let width = self.columns.len();

        if !self.contains(name) {
            let mut fields = vec![String::new(); width];
            fields[0] = name.to_string();
            self.lines.push(SettingsLine::Row(SettingsRow { fields }));
        }
        let Some(row) = self.row_mut(name) else {
            return;
        };
        if let Some(i) = type_idx {
            row.fields[i] = kind.to_string();
        }
        if let Some(i) = encoding_idx {
            row.fields[i] = encoding.to_string();
        }
        row.fields[value_idx] = value.into();
    }

    /// Whether the namespace row `<namespace>,namespace,,` is present
    pub fn has_namespace(&self, namespace: &str) -> bool {
        match self.column_index(TYPE_COLUMN) {
            Some(_) => self.field(namespace, TYPE_COLUMN) == Some("namespace"),
            None => self.contains(namespace),
        }
    }
}

/// Merge user settings into release settings
///
/// The result keeps the release file's layout, comments and row order,
/// takes the user's value for every parameter both files define, and
/// appends parameters only the user file has.
pub fn merge(release: &SettingsRecord, user: &SettingsRecord) -> SettingsRecord {
    let mut merged = release.clone();
    let user_value_idx = user.value_index();
    for row in user.rows() {
        let value = row.fields[user_value_idx].clone();
        if merged.contains(row.name()) {
            // Existing release row: only the value is taken from the user
            let _ = merged.set(row.name(), value);
        } else {
            let kind = user.field(row.name(), TYPE_COLUMN).unwrap_or("data");
            let encoding = user.field(row.name(), ENCODING_COLUMN).unwrap_or("string");
            merged.upsert(row.name(), kind, encoding, value);
        }
    }
    merged
}

/// Path the merged settings are written to: `<stem>_merged.csv` next to `user`
pub fn merged_path(user: &Path) -> PathBuf {
    let stem = user
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("settings");
    user.with_file_name(format!("{}_merged.csv", stem))
}

/// Merge two settings files and write the result next to the user file
pub fn merge_files(release: &Path, user: &Path) -> ProvisionResult<PathBuf> {
    let merged = merge(&SettingsRecord::load(release)?, &SettingsRecord::load(user)?);
    let out = merged_path(user);
    merged.save(&out)?;
    debug!(path = %out.display(), "Wrote merged settings");
    Ok(out)
}

/// Embed a license into the settings under `key`
///
/// The namespace row must be present; a settings record without it cannot
/// be loaded by the device.
pub fn embed_license(
    record: &mut SettingsRecord,
    license: &License,
    key: &str,
    namespace: &str,
) -> ProvisionResult<()> {
    if !record.has_namespace(namespace) {
        return Err(ProvisionError::validation(format!(
            "required namespace row '{}' is missing",
            namespace
        )));
    }
    record.upsert(key, "data", "string", license.to_base64());
    Ok(())
}

pub(crate) fn row_from_fields(fields: Vec<String>) -> ProvisionResult<SettingsRow> {
    match fields.first() {
        Some(name) if !name.is_empty() => Ok(SettingsRow { fields }),
        _ => Err(ProvisionError::validation("settings row without a parameter name")),
    }
}

fn read_fields(text: &str) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut record = csv::StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Ok(Vec::new());
    }
    Ok(record.iter().map(str::to_string).collect())
}

/// One CSV record terminated by `\n`
fn write_fields(fields: &[String]) -> ProvisionResult<String> {
    // Quote a leading '#' so the row is not read back as a comment
    let style = match fields.first() {
        Some(name) if name.trim_start().starts_with('#') => csv::QuoteStyle::Always,
        _ => csv::QuoteStyle::Necessary,
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(style)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| ProvisionError::validation(format!("cannot write settings row: {}", e)))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ProvisionError::validation(format!("cannot write settings row: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| ProvisionError::validation(format!("settings row is not UTF-8: {}", e)))
}
