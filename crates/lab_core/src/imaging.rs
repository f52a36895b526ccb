use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use lab_shared::{
    domain::{ConcentrationSummary, MeasurementSample, RunId, SolutionType},
    error::ProtocolError,
    protocol::ImageMeta,
};
use tracing::{debug, info};

pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        // Controller images are PNG unless they say otherwise.
        "image/png"
    }
}

/// Displayable image built from a raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub mime: &'static str,
    pub size: usize,
    pub data_uri: String,
}

impl ImageHandle {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mime = sniff_mime(bytes);
        Self {
            mime,
            size: bytes.len(),
            data_uri: format!("data:{mime};base64,{}", STANDARD.encode(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub solution_type: SolutionType,
    pub concentration: Option<f64>,
    pub rgb: Option<[f64; 3]>,
    pub timestamp: Option<String>,
    pub cycle: Option<u32>,
    pub image: ImageHandle,
}

impl ImageResult {
    pub fn to_sample(&self) -> MeasurementSample {
        MeasurementSample {
            cycle: self.cycle,
            solution_type: self.solution_type,
            concentration: self.concentration,
            rgb: self.rgb,
            timestamp: self.timestamp.clone(),
            source_image: Some(self.image.data_uri.clone()),
        }
    }
}

/// Pairs image metadata with the raw payload that follows it. Each tag has a
/// single slot; a raw payload only ever uses the most recent metadata.
#[derive(Debug, Default)]
pub struct ImageCorrelator {
    pending: HashMap<SolutionType, ImageMeta>,
    latest_tag: Option<SolutionType>,
    results: BTreeMap<SolutionType, Vec<ImageResult>>,
}

impl ImageCorrelator {
    pub fn accept_meta(&mut self, meta: ImageMeta) -> Option<SolutionType> {
        let Some(tag) = meta.solution() else {
            debug!(
                solution_type = ?meta.solution_type,
                "imaging: metadata without a known tag; next raw image will be dropped"
            );
            self.latest_tag = None;
            return None;
        };
        self.pending.insert(tag, meta);
        self.latest_tag = Some(tag);
        Some(tag)
    }

    pub fn accept_raw(&mut self, bytes: &[u8]) -> Result<ImageResult, ProtocolError> {
        let tag = self.latest_tag.take().ok_or_else(|| {
            ProtocolError::UncorrelatedImage("no metadata announced this image".into())
        })?;
        let meta = self.pending.remove(&tag).ok_or_else(|| {
            ProtocolError::UncorrelatedImage(format!("metadata for '{tag}' was already used"))
        })?;
        let result = ImageResult {
            solution_type: tag,
            concentration: meta.concentration,
            rgb: meta.rgb,
            timestamp: meta.timestamp,
            cycle: meta.cycle,
            image: ImageHandle::from_bytes(bytes),
        };
        info!(
            solution_type = %tag,
            concentration = ?result.concentration,
            size = bytes.len(),
            "imaging: image correlated"
        );
        self.results.entry(tag).or_default().push(result.clone());
        Ok(result)
    }

    pub fn results(&self, tag: SolutionType) -> &[ImageResult] {
        self.results.get(&tag).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn latest(&self, tag: SolutionType) -> Option<&ImageResult> {
        self.results(tag).last()
    }

    pub fn all_results(&self) -> impl Iterator<Item = &ImageResult> {
        self.results.values().flatten()
    }

    pub fn summary(&self) -> ConcentrationSummary {
        ConcentrationSummary::from_samples(
            self.all_results()
                .map(|result| (result.solution_type, result.concentration)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait CaptureHandle: Send {
    async fn grab_frame(&mut self) -> Result<CapturedFrame>;
    fn release(self: Box<Self>);
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn CaptureHandle>>;
}

/// Serves frames from an image file, for benches where the camera is exposed
/// as a snapshot written to disk.
pub struct FileCaptureDevice {
    path: PathBuf,
}

impl FileCaptureDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct FileCaptureHandle {
    path: PathBuf,
}

#[async_trait]
impl CaptureHandle for FileCaptureHandle {
    async fn grab_frame(&mut self) -> Result<CapturedFrame> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read frame from '{}'", self.path.display()))?;
        Ok(CapturedFrame {
            mime: sniff_mime(&bytes).to_string(),
            bytes,
        })
    }

    fn release(self: Box<Self>) {
        debug!(path = %self.path.display(), "imaging: released file capture");
    }
}

#[async_trait]
impl CaptureDevice for FileCaptureDevice {
    async fn acquire(&self) -> Result<Box<dyn CaptureHandle>> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("capture source '{}' is unavailable", self.path.display()))?;
        anyhow::ensure!(
            metadata.is_file(),
            "capture source '{}' is not a file",
            self.path.display()
        );
        Ok(Box::new(FileCaptureHandle {
            path: self.path.clone(),
        }))
    }
}

/// Device-requested capture awaiting the operator.
pub struct CaptureSession {
    pub run_id: RunId,
    pub cycle: Option<u32>,
    pub opened_at: DateTime<Utc>,
    handle: Option<Box<dyn CaptureHandle>>,
}

impl CaptureSession {
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn attach(&mut self, handle: Box<dyn CaptureHandle>) {
        if let Some(previous) = self.handle.replace(handle) {
            previous.release();
        }
    }

    pub fn handle_mut(&mut self) -> Option<&mut Box<dyn CaptureHandle>> {
        self.handle.as_mut()
    }

    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("run_id", &self.run_id)
            .field("cycle", &self.cycle)
            .field("opened_at", &self.opened_at)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CaptureSessions {
    sessions: HashMap<RunId, CaptureSession>,
}

impl CaptureSessions {
    /// Opens a session, or moves an existing one to the new cycle while
    /// keeping an acquired handle. Returns true for a new session.
    pub fn open(&mut self, run_id: RunId, cycle: Option<u32>, now: DateTime<Utc>) -> bool {
        if let Some(existing) = self.sessions.get_mut(&run_id) {
            existing.cycle = cycle.or(existing.cycle);
            return false;
        }
        self.sessions.insert(
            run_id.clone(),
            CaptureSession {
                run_id,
                cycle,
                opened_at: now,
                handle: None,
            },
        );
        true
    }

    pub fn is_open(&self, run_id: &RunId) -> bool {
        self.sessions.contains_key(run_id)
    }

    pub fn cycle(&self, run_id: &RunId) -> Option<Option<u32>> {
        self.sessions.get(run_id).map(|session| session.cycle)
    }

    pub fn take(&mut self, run_id: &RunId) -> Option<CaptureSession> {
        self.sessions.remove(run_id)
    }

    /// Returns a session taken for a capture attempt that did not finish.
    pub fn restore(&mut self, session: CaptureSession) {
        match self.sessions.get(&session.run_id) {
            Some(_) => session.release(),
            None => {
                self.sessions.insert(session.run_id.clone(), session);
            }
        }
    }

    /// Releases the handle without telling the controller anything.
    pub fn cancel(&mut self, run_id: &RunId) -> bool {
        match self.sessions.remove(run_id) {
            Some(session) => {
                session.release();
                info!(run_id = %run_id, "imaging: capture cancelled");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/imaging_tests.rs"]
mod tests;
