use async_trait::async_trait;
use lab_shared::{
    domain::{NewRun, RunId, RunPhase, RunRecord},
    error::ApiErrorBody,
};
use reqwest::{Client, Response};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::{error::BackendError, registry::RunEntry};

/// Body of `PUT /runs/{id}/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCheckpoint {
    #[serde(skip)]
    pub run_id: RunId,
    #[serde(skip)]
    pub phase: RunPhase,
    pub status: String,
    pub stage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
}

impl StatusCheckpoint {
    pub fn from_entry(entry: &RunEntry) -> Self {
        Self {
            run_id: entry.run_id.clone(),
            phase: entry.phase,
            status: entry.phase.checkpoint_status().to_string(),
            stage: entry.stage,
            cycle: (entry.cycle > 0).then_some(entry.cycle),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointAck {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub stage: u32,
    pub cycle: u32,
}

impl CheckpointAck {
    pub fn echo(checkpoint: &StatusCheckpoint) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            phase: checkpoint.phase,
            stage: checkpoint.stage,
            cycle: checkpoint.cycle.unwrap_or(0),
        }
    }

    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.trial_id.clone(),
            phase: record.phase(),
            stage: record.stage.unwrap_or(0),
            cycle: record.cycle.unwrap_or(0),
        }
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_run(&self, run: &NewRun) -> Result<RunId, BackendError>;
    async fn list_runs(&self) -> Result<Vec<RunRecord>, BackendError>;
    async fn update_status(&self, checkpoint: &StatusCheckpoint)
        -> Result<CheckpointAck, BackendError>;
    async fn delete_run(&self, run_id: &RunId) -> Result<(), BackendError>;
}

/// REST client for the run store.
pub struct HttpPersistence {
    http: Client,
    base_url: Url,
}

impl HttpPersistence {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| anyhow::anyhow!("invalid backend url '{base_url}': {err}"))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            anyhow::bail!("backend url must be http(s): {base_url}");
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<ApiErrorBody>()
        .await
        .ok()
        .and_then(ApiErrorBody::into_message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(BackendError::Status {
        status: status.as_u16(),
        message,
    })
}

fn created_run_id(body: &serde_json::Value) -> Option<RunId> {
    ["id", "trial_id"]
        .iter()
        .filter_map(|key| body.get(*key))
        .find(|value| !value.is_null())
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

#[async_trait]
impl PersistenceGateway for HttpPersistence {
    async fn create_run(&self, run: &NewRun) -> Result<RunId, BackendError> {
        let response = self
            .http
            .post(self.endpoint(&["runs"]))
            .json(run)
            .send()
            .await?;
        let body: serde_json::Value = check(response).await?.json().await?;
        let run_id = created_run_id(&body).ok_or(BackendError::MissingRunId)?;
        info!(run_id = %run_id, name = %run.trial_name, "backend: run created");
        Ok(run_id)
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, BackendError> {
        let response = self.http.get(self.endpoint(&["runs"])).send().await?;
        let records: Vec<RunRecord> = check(response).await?.json().await?;
        debug!(count = records.len(), "backend: listed runs");
        Ok(records)
    }

    async fn update_status(
        &self,
        checkpoint: &StatusCheckpoint,
    ) -> Result<CheckpointAck, BackendError> {
        let response = self
            .http
            .put(self.endpoint(&["runs", checkpoint.run_id.as_str(), "status"]))
            .json(checkpoint)
            .send()
            .await?;
        let body = check(response).await?.bytes().await?;
        let ack = serde_json::from_slice::<RunRecord>(&body)
            .ok()
            .map(|record| CheckpointAck::from_record(&record))
            .unwrap_or_else(|| CheckpointAck::echo(checkpoint));
        debug!(
            run_id = %checkpoint.run_id,
            status = %checkpoint.status,
            stage = checkpoint.stage,
            "backend: status checkpoint stored"
        );
        Ok(ack)
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), BackendError> {
        let response = self
            .http
            .delete(self.endpoint(&["runs", run_id.as_str()]))
            .send()
            .await?;
        check(response).await?;
        info!(run_id = %run_id, "backend: run deleted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;
