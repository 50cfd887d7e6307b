//! ``src/model/filter.rs``
//! ============================================================================
//! # `FilterCriteria`: catalog query constraints
//!
//! Every field is optional; an absent field means "no constraint". The same
//! names are used in Rust and on the wire (`file_name`, `file_type`,
//! `min_size`, `max_size`, `from_date`, `to_date`), so there is exactly one
//! spelling of each constraint.
//!
//! Criteria are always kept normalized: whitespace trimmed, empty strings
//! dropped, type tags stripped of a leading dot. Type tags keep their case:
//! the collaborator compares them exactly, so `PDF` and `pdf` are different
//! constraints. Two criteria that constrain the same way produce the same
//! cache key.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::{
    error::{SyncError, SyncResult},
    model::file::FileRecord,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Constraints applied to a file listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_date: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_date: Option<NaiveDate>,
}

/// Individually editable filter-panel fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterField {
    FileName,
    FileType,
    MinSize,
    MaxSize,
    FromDate,
    ToDate,
}

impl FilterField {
    /// Wire parameter name.
    #[must_use]
    pub const fn param(self) -> &'static str {
        match self {
            Self::FileName => "file_name",
            Self::FileType => "file_type",
            Self::MinSize => "min_size",
            Self::MaxSize => "max_size",
            Self::FromDate => "from_date",
            Self::ToDate => "to_date",
        }
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param())
    }
}

impl std::str::FromStr for FilterField {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_name" => Ok(Self::FileName),
            "file_type" => Ok(Self::FileType),
            "min_size" => Ok(Self::MinSize),
            "max_size" => Ok(Self::MaxSize),
            "from_date" => Ok(Self::FromDate),
            "to_date" => Ok(Self::ToDate),
            other => Err(SyncError::validation(format!("unknown filter field '{other}'"))),
        }
    }
}

fn clean_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn clean_type(raw: &str) -> Option<String> {
    clean_text(raw.trim().trim_start_matches('.'))
}

impl FilterCriteria {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no field constrains the listing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Normalized copy: trimmed text, empty strings dropped.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            file_name: self.file_name.as_deref().and_then(clean_text),
            file_type: self.file_type.as_deref().and_then(clean_type),
            ..self.clone()
        }
    }

    /// Replace the name constraint; blank text clears it.
    pub fn set_file_name(&mut self, name: &str) {
        self.file_name = clean_text(name);
    }

    /// Apply raw filter-panel input to one field.
    ///
    /// Empty input clears the field. Unparsable input leaves the criteria
    /// untouched and returns a validation error.
    pub fn set_field(&mut self, field: FilterField, raw: &str) -> SyncResult<()> {
        let raw = raw.trim();

        match field {
            FilterField::FileName => self.file_name = clean_text(raw),
            FilterField::FileType => self.file_type = clean_type(raw),
            FilterField::MinSize => self.min_size = parse_size(field, raw)?,
            FilterField::MaxSize => self.max_size = parse_size(field, raw)?,
            FilterField::FromDate => self.from_date = parse_date(field, raw)?,
            FilterField::ToDate => self.to_date = parse_date(field, raw)?,
        }

        Ok(())
    }

    /// Query parameters in wire order, absent fields omitted.
    #[must_use]
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let n = self.normalized();
        let mut pairs = Vec::with_capacity(6);

        if let Some(v) = n.file_name {
            pairs.push((FilterField::FileName.param(), v));
        }
        if let Some(v) = n.file_type {
            pairs.push((FilterField::FileType.param(), v));
        }
        if let Some(v) = n.min_size {
            pairs.push((FilterField::MinSize.param(), v.to_string()));
        }
        if let Some(v) = n.max_size {
            pairs.push((FilterField::MaxSize.param(), v.to_string()));
        }
        if let Some(v) = n.from_date {
            pairs.push((FilterField::FromDate.param(), v.format(DATE_FORMAT).to_string()));
        }
        if let Some(v) = n.to_date {
            pairs.push((FilterField::ToDate.param(), v.format(DATE_FORMAT).to_string()));
        }

        pairs
    }

    /// Stable string used as the criteria half of a cache key.
    #[must_use]
    pub fn cache_key(&self) -> CompactString {
        let mut key = CompactString::default();
        for (i, (name, value)) in self.to_query_pairs().into_iter().enumerate() {
            if i > 0 {
                key.push('&');
            }
            key.push_str(name);
            key.push('=');
            key.push_str(&value);
        }
        key
    }

    /// Local evaluation of the collaborator's filter semantics.
    #[must_use]
    pub fn matches(&self, record: &FileRecord) -> bool {
        let n = self.normalized();

        if let Some(name) = &n.file_name
            && !record.name.to_lowercase().contains(&name.to_lowercase())
        {
            return false;
        }
        if let Some(ty) = &n.file_type
            && record.file_type != *ty
        {
            return false;
        }
        if n.min_size.is_some_and(|min| record.size < min) {
            return false;
        }
        if n.max_size.is_some_and(|max| record.size > max) {
            return false;
        }
        if n.from_date.is_some_and(|d| record.uploaded_at < day_start(d)) {
            return false;
        }
        if n.to_date.is_some_and(|d| record.uploaded_at > day_start(d)) {
            return false;
        }

        true
    }
}

// Bare dates compare as midnight UTC, matching the collaborator's datetime filter.
fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn parse_size(field: FilterField, raw: &str) -> SyncResult<Option<u64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| SyncError::validation(format!("{field} must be a non-negative integer")))
}

fn parse_date(field: FilterField, raw: &str) -> SyncResult<Option<NaiveDate>> {
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map(Some)
        .map_err(|_| SyncError::validation(format!("{field} must be a YYYY-MM-DD date")))
}
