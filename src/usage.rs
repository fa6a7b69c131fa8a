//! Usage recording and spend accounting.
//!
//! Both are fire-and-forget from the request path: outcomes are queued on an
//! unbounded channel and drained by one background task, so a slow or failing
//! sink never delays or fails a response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::unified::UnifiedResponse;

const MAX_LOG_ENTRIES: usize = 10_000;

/// One routed call, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageOutcome {
    pub request_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub gate_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub used_platform_key: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageOutcome {
    /// Outcome of a completed call; `response` is the one-shot response or
    /// the terminal chunk of a stream.
    pub fn success(
        owner_id: Option<&str>,
        gate_id: &str,
        provider: Option<&str>,
        response: &UnifiedResponse,
    ) -> Self {
        let usage = response.usage.unwrap_or_default();
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.map(String::from),
            gate_id: gate_id.to_string(),
            model: Some(response.model.clone()),
            provider: provider.map(String::from),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd: response.cost.unwrap_or(0.0),
            latency_ms: response.latency_ms.unwrap_or(0),
            used_platform_key: response.used_platform_key,
            success: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(owner_id: Option<&str>, gate_id: &str, error: &GatewayError) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.map(String::from),
            gate_id: gate_id.to_string(),
            model: None,
            provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            used_platform_key: false,
            success: false,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn log_request(&self, outcome: &UsageOutcome) -> Result<()>;
}

#[async_trait]
pub trait SpendTracker: Send + Sync {
    async fn track_spending(&self, owner_id: &str, cost_usd: f64) -> Result<()>;
}

/// Handle the request path uses to hand off outcomes.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: Option<mpsc::UnboundedSender<UsageOutcome>>,
}

impl UsageRecorder {
    /// Spawn the background worker. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Option<Arc<dyn UsageSink>>, spend: Option<Arc<dyn SpendTracker>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsageOutcome>();

        tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                if let Some(sink) = &sink {
                    if let Err(e) = sink.log_request(&outcome).await {
                        warn!(request_id = %outcome.request_id, "Usage logging failed: {}", e);
                    }
                }
                let Some(spend) = &spend else { continue };
                let Some(owner) = outcome.owner_id.as_deref() else { continue };
                if outcome.success && outcome.cost_usd > 0.0 {
                    if let Err(e) = spend.track_spending(owner, outcome.cost_usd).await {
                        warn!(owner, "Spend tracking failed: {}", e);
                    }
                }
            }
            debug!("Usage recorder stopped");
        });

        Self { tx: Some(tx) }
    }

    /// A recorder that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn record(&self, outcome: UsageOutcome) {
        let Some(tx) = &self.tx else { return };
        if tx.send(outcome).is_err() {
            warn!("Usage recorder is gone; outcome dropped");
        }
    }
}

/// Ring buffer of recent outcomes, persisted as JSON lines.
pub struct UsageLog {
    entries: VecDeque<UsageOutcome>,
    file_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl UsageLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(1024);
        if file_path.exists() {
            let reader = BufReader::new(File::open(&file_path)?);
            for line in reader.lines().map_while(|l| l.ok()) {
                if let Ok(entry) = serde_json::from_str::<UsageOutcome>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&file_path)?;
        Ok(Self {
            entries,
            file_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn append(&mut self, outcome: UsageOutcome) -> std::io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            let json = serde_json::to_string(&outcome)?;
            writeln!(writer, "{json}")?;
            writer.flush()?;
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(outcome);
        Ok(())
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<UsageOutcome> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Rewrite the file with only the retained entries.
    pub fn compact(&mut self) -> std::io::Result<()> {
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            writeln!(writer, "{}", serde_json::to_string(entry)?)?;
        }
        writer.flush()?;

        let file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

/// [`UsageLog`] shared behind a mutex, usable as a [`UsageSink`].
#[derive(Clone)]
pub struct JsonlUsageLog(Arc<Mutex<UsageLog>>);

impl JsonlUsageLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(UsageLog::open(file_path)?))))
    }

    pub fn recent(&self, limit: usize) -> Vec<UsageOutcome> {
        self.0.lock().map(|log| log.recent(limit)).unwrap_or_default()
    }

    pub fn compact(&self) -> Result<()> {
        let mut log = self
            .0
            .lock()
            .map_err(|_| GatewayError::config("usage log lock poisoned"))?;
        Ok(log.compact()?)
    }
}

#[async_trait]
impl UsageSink for JsonlUsageLog {
    async fn log_request(&self, outcome: &UsageOutcome) -> Result<()> {
        let log = self.0.clone();
        let outcome = outcome.clone();
        // File writes block; keep them off the runtime's worker threads.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut log = log
                .lock()
                .map_err(|_| GatewayError::config("usage log lock poisoned"))?;
            Ok(log.append(outcome)?)
        })
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?
    }
}

/// Running USD totals per owner.
#[derive(Debug, Default)]
pub struct SpendLedger {
    totals: Mutex<HashMap<String, f64>>,
}

impl SpendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, owner_id: &str) -> f64 {
        self.totals
            .lock()
            .ok()
            .and_then(|t| t.get(owner_id).copied())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl SpendTracker for SpendLedger {
    async fn track_spending(&self, owner_id: &str, cost_usd: f64) -> Result<()> {
        let mut totals = self
            .totals
            .lock()
            .map_err(|_| GatewayError::config("spend ledger lock poisoned"))?;
        *totals.entry(owner_id.to_string()).or_insert(0.0) += cost_usd;
        Ok(())
    }
}
