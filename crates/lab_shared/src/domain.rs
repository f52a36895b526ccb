use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const DEFAULT_STAGES: [&str; 7] = [
    "Sample Preparation",
    "Dissolution",
    "Filtration",
    "Dilution",
    "Sampling",
    "Color Agent Addition",
    "Data Analysis",
];
pub const DEFAULT_MAX_CYCLES: u32 = 5;
/// Stage run once per run before the first cycle.
pub const PREPARATION_STAGE: u32 = 0;
/// Stage a cycle restarts from once preparation is done.
pub const FIRST_CYCLE_STAGE: u32 = 1;

/// Backend-assigned run identifier. Integer ids are kept in their decimal
/// form and written back to the wire as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for RunId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for RunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.parse::<i64>() {
            Ok(numeric) if numeric.to_string() == self.0 => serializer.serialize_i64(numeric),
            _ => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawRunId {
            Int(i64),
            Text(String),
        }

        Ok(match RawRunId::deserialize(deserializer)? {
            RawRunId::Int(value) => Self::from(value),
            RawRunId::Text(value) => Self(value),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Started,
    Running,
    /// Operator declined to continue; the controller has not confirmed the stop yet.
    StopRequested,
    Completed,
    Failed,
    Stopped,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Started | Self::Running | Self::StopRequested)
    }

    /// Status string written to the backend for this phase.
    pub fn checkpoint_status(self) -> &'static str {
        match self {
            Self::Idle => "pending",
            Self::Started | Self::Running => "running",
            Self::StopRequested => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped_by_user",
        }
    }

    pub fn from_backend_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "started" => Self::Started,
            "running" => Self::Running,
            "stopping" => Self::StopRequested,
            "completed" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "stopped" | "stopped_by_user" => Self::Stopped,
            _ => Self::Idle,
        }
    }

    /// Rank used to refuse backend echoes that would move a run backwards.
    pub fn progress_rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Started => 1,
            Self::Running => 2,
            Self::StopRequested => 3,
            Self::Completed | Self::Failed | Self::Stopped => 4,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Running => "running",
            Self::StopRequested => "stop requested",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Active,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageList {
    names: Vec<String>,
}

impl StageList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, stage: u32) -> Option<&str> {
        self.names.get(stage as usize).map(String::as_str)
    }

    pub fn is_complete(&self, stage: u32) -> bool {
        stage >= self.len()
    }

    pub fn progress_percent(&self, stage: u32) -> u8 {
        let total = self.len().max(1);
        if stage >= total {
            return 100;
        }
        let pct = (f64::from(stage) / f64::from(total) * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Per-step status for a stepper. An interrupted run keeps the steps it
    /// finished and marks everything after them as failed.
    pub fn step_statuses(&self, stage: u32, interrupted: bool) -> Vec<StepStatus> {
        let total = self.len();
        (0..total)
            .map(|index| {
                if self.is_complete(stage) && !interrupted {
                    StepStatus::Done
                } else if interrupted {
                    if index < stage.min(total) {
                        StepStatus::Done
                    } else {
                        StepStatus::Failed
                    }
                } else if index < stage {
                    StepStatus::Done
                } else if index == stage {
                    StepStatus::Active
                } else {
                    StepStatus::Waiting
                }
            })
            .collect()
    }
}

impl Default for StageList {
    fn default() -> Self {
        Self::new(DEFAULT_STAGES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SolutionType {
    Al,
    Si,
}

impl SolutionType {
    pub const ALL: [SolutionType; 2] = [SolutionType::Al, SolutionType::Si];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "al" | "aluminum" | "aluminium" => Some(Self::Al),
            "si" | "silicon" => Some(Self::Si),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Al => "al",
            Self::Si => "si",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Al => "Aluminum",
            Self::Si => "Silicon",
        }
    }
}

impl fmt::Display for SolutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for SolutionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for SolutionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_tag(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown solution type '{raw}'")))
    }
}

/// One measured sample as stored with a run on the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    pub solution_type: SolutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concentration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rgb: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcentrationSummary {
    pub aluminum: f64,
    pub silicon: f64,
    pub dissolution_index: f64,
    pub si_al_ratio: f64,
    pub has_results: bool,
}

impl ConcentrationSummary {
    pub fn from_samples<I>(samples: I) -> Self
    where
        I: IntoIterator<Item = (SolutionType, Option<f64>)>,
    {
        let (mut al_sum, mut al_count, mut si_sum, mut si_count) = (0.0, 0u32, 0.0, 0u32);
        for (solution_type, concentration) in samples {
            let value = concentration.unwrap_or(0.0);
            match solution_type {
                SolutionType::Al => {
                    al_sum += value;
                    al_count += 1;
                }
                SolutionType::Si => {
                    si_sum += value;
                    si_count += 1;
                }
            }
        }
        let aluminum = if al_count > 0 {
            al_sum / f64::from(al_count)
        } else {
            0.0
        };
        let silicon = if si_count > 0 {
            si_sum / f64::from(si_count)
        } else {
            0.0
        };
        Self {
            aluminum,
            silicon,
            dissolution_index: 1.54 * aluminum + silicon,
            si_al_ratio: if aluminum > 0.0 { silicon / aluminum } else { 0.0 },
            has_results: al_count + si_count > 0,
        }
    }
}

/// Run as returned by the backend `GET /runs` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub trial_id: RunId,
    #[serde(default)]
    pub trial_name: String,
    #[serde(default)]
    pub trial_operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<MeasurementSample>,
}

impl RunRecord {
    pub fn phase(&self) -> RunPhase {
        self.status
            .as_deref()
            .map(RunPhase::from_backend_status)
            .unwrap_or(RunPhase::Idle)
    }

    pub fn summary(&self) -> ConcentrationSummary {
        ConcentrationSummary::from_samples(
            self.results
                .iter()
                .map(|sample| (sample.solution_type, sample.concentration)),
        )
    }
}

/// Body of the run-creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub trial_name: String,
    pub trial_operator: String,
    pub sample_size: f64,
    pub cement_added: bool,
    pub syringe_filters_swapped: bool,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
