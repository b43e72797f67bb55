use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Job Models
// ============================================================================

/// Cron-like schedule signature of a job.
///
/// Field names are among `year`, `month`, `day`, `week`, `day_of_week`,
/// `hour`, `minute` and `second`; any subset may be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleSpec(BTreeMap<String, String>);

impl ScheduleSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ScheduleSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Canonical identifier of a schedule signature.
///
/// Derived by sorting the spec's fields by name and joining `name=value`
/// pairs with `;`. Backslash, `;` and `=` inside names and values are
/// escaped with a backslash, so distinct specs never share a key. The empty
/// spec maps to `*`, which no non-empty spec can produce because every pair
/// contains an unescaped `=`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn from_spec(spec: &ScheduleSpec) -> Self {
        if spec.is_empty() {
            return Self("*".to_string());
        }

        let joined = spec
            .fields()
            .map(|(name, value)| {
                format!("{}={}", escape_key_part(name), escape_key_part(value))
            })
            .collect::<Vec<_>>()
            .join(";");

        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, '\\' | ';' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ScheduleSpec> for BucketKey {
    fn from(spec: &ScheduleSpec) -> Self {
        Self::from_spec(spec)
    }
}

/// A job definition as stored in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(alias = "code")]
    pub source_code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub pending_deletion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl JobRecord {
    /// Create an unsynced record with a fresh id
    pub fn new(
        schedule: ScheduleSpec,
        dependencies: Vec<String>,
        source_code: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let record = Self {
            id: Uuid::new_v4(),
            schedule,
            dependencies,
            source_code: source_code.into(),
            name: String::new(),
            synced: false,
            pending_deletion: false,
            timezone: None,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::from_spec(&self.schedule)
    }

    /// The source must never be blank
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_code.trim().is_empty() {
            return Err(ValidationError::MissingField("source_code".to_string()));
        }
        Ok(())
    }
}

/// Request for the scheduler adapter to arm a bucket's trigger.
///
/// Emitted once per materialized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRegistration {
    pub bucket_key: BucketKey,
    pub job_id: Uuid,
    pub schedule: ScheduleSpec,
    pub timezone: Option<String>,
}

impl From<&JobRecord> for ScheduleRegistration {
    fn from(record: &JobRecord) -> Self {
        Self {
            bucket_key: record.bucket_key(),
            job_id: record.id,
            schedule: record.schedule.clone(),
            timezone: record.timezone.clone(),
        }
    }
}
