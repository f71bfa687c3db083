//! Deterministic adapter driven by queued per-region steps. Used by the
//! integration tests and the probe demo.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use super::{Fetched, ProviderAdapter};
use crate::error::ProviderError;
use crate::model::Sample;

#[derive(Debug, Clone)]
pub enum Step {
    /// Canonical-unit value.
    Value(f64),
    /// Value plus a remaining-quota hint.
    ValueWithQuota(f64, u32),
    Fail(String),
    Malformed(String),
    /// Never resolves; exercises the call deadline.
    Hang,
    /// Answers with the value once the gate is notified.
    Held(Arc<Notify>, f64),
}

pub struct ScriptedProvider {
    name: String,
    queued: Mutex<HashMap<String, VecDeque<Step>>>,
    sticky: Mutex<HashMap<String, Step>>,
    calls: AtomicUsize,
    probe_ok: AtomicBool,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queued: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            probe_ok: AtomicBool::new(true),
        }
    }

    /// Answer used whenever nothing is queued for `region`.
    pub fn respond(&self, region: &str, step: Step) -> &Self {
        self.sticky
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(region.to_string(), step);
        self
    }

    /// One-shot answer, consumed before the sticky one.
    pub fn enqueue(&self, region: &str, step: Step) -> &Self {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(region.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    /// Number of `fetch` calls that reached the adapter.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self, region: &str) -> Option<Step> {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(region)
            .and_then(|q| q.pop_front());
        queued.or_else(|| {
            self.sticky
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(region)
                .cloned()
        })
    }

    fn sample(&self, region: &str, value: f64) -> Sample {
        Sample {
            source: self.name.clone(),
            region: region.to_string(),
            carbon_intensity: value,
            timestamp: Utc::now(),
            provider_meta: None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, region: &str) -> Result<Fetched, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step(region) {
            Some(Step::Value(v)) => Ok(Fetched::new(self.sample(region, v))),
            Some(Step::ValueWithQuota(v, q)) => Ok(Fetched {
                sample: self.sample(region, v),
                quota_remaining: Some(q),
            }),
            Some(Step::Fail(reason)) => Err(ProviderError::unavailable(&self.name, reason)),
            Some(Step::Malformed(detail)) => Err(ProviderError::integrity(&self.name, region, detail)),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Held(gate, v)) => {
                gate.notified().await;
                Ok(Fetched::new(self.sample(region, v)))
            }
            None => Err(ProviderError::unavailable(&self.name, "no scripted response")),
        }
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::unavailable(&self.name, "probe failed"))
        }
    }
}
