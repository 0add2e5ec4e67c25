//! Metric families and the registry that owns them.
//!
//! A family is a name, a help string, a fixed list of label names and a map
//! from label values to the current sample. Handles (`GaugeVec`,
//! `CounterVec`) are cheap clones sharing the family with the registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{MetricsError, MetricsResult};

/// Prometheus metric type of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

pub(crate) struct Family {
    pub(crate) name: String,
    pub(crate) help: String,
    pub(crate) metric_type: MetricType,
    pub(crate) label_names: Vec<String>,
    samples: Mutex<BTreeMap<Vec<String>, f64>>,
}

impl Family {
    fn samples(&self) -> MutexGuard<'_, BTreeMap<Vec<String>, f64>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current samples, ordered by label values.
    pub(crate) fn snapshot(&self) -> Vec<(Vec<String>, f64)> {
        self.samples()
            .iter()
            .map(|(labels, value)| (labels.clone(), *value))
            .collect()
    }

    fn key(&self, labels: &[&str]) -> Option<Vec<String>> {
        if labels.len() != self.label_names.len() {
            warn!(
                metric = %self.name,
                expected = self.label_names.len(),
                got = labels.len(),
                "label count mismatch, sample dropped"
            );
            return None;
        }
        Some(labels.iter().map(|l| l.to_string()).collect())
    }
}

/// Owns every metric family exported by the process.
#[derive(Default)]
pub struct Registry {
    families: Mutex<BTreeMap<String, Arc<Family>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        name: &str,
        help: &str,
        metric_type: MetricType,
        label_names: &[&str],
    ) -> MetricsResult<Arc<Family>> {
        if !is_valid_name(name) || !label_names.iter().all(|l| is_valid_name(l)) {
            return Err(MetricsError::InvalidName(name.to_string()));
        }

        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        if families.contains_key(name) {
            return Err(MetricsError::AlreadyRegistered(name.to_string()));
        }
        let family = Arc::new(Family {
            name: name.to_string(),
            help: help.to_string(),
            metric_type,
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            samples: Mutex::new(BTreeMap::new()),
        });
        families.insert(name.to_string(), Arc::clone(&family));
        Ok(family)
    }

    /// Register a gauge family.
    pub fn gauge_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> MetricsResult<GaugeVec> {
        let family = self.register(name, help, MetricType::Gauge, label_names)?;
        Ok(GaugeVec { family })
    }

    /// Register a counter family.
    pub fn counter_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> MetricsResult<CounterVec> {
        let family = self.register(name, help, MetricType::Counter, label_names)?;
        Ok(CounterVec { family })
    }

    /// Every registered family, ordered by name.
    pub(crate) fn families(&self) -> Vec<Arc<Family>> {
        self.families
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A family of gauges keyed by label values.
#[derive(Clone)]
pub struct GaugeVec {
    family: Arc<Family>,
}

impl GaugeVec {
    pub fn set(&self, labels: &[&str], value: f64) {
        if let Some(key) = self.family.key(labels) {
            self.family.samples().insert(key, value);
        }
    }

    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        let key = self.family.key(labels)?;
        self.family.samples().get(&key).copied()
    }

    /// Swap in a complete set of samples. Label sets missing from `samples`
    /// disappear; readers see either the old set or the new one.
    pub fn replace<L: AsRef<str>>(&self, samples: impl IntoIterator<Item = (Vec<L>, f64)>) {
        let mut next = BTreeMap::new();
        for (labels, value) in samples {
            let labels: Vec<&str> = labels.iter().map(AsRef::as_ref).collect();
            if let Some(key) = self.family.key(&labels) {
                next.insert(key, value);
            }
        }
        *self.family.samples() = next;
    }
}

/// A family of monotonically increasing counters keyed by label values.
#[derive(Clone)]
pub struct CounterVec {
    family: Arc<Family>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[&str]) {
        self.inc_by(labels, 1.0);
    }

    pub fn inc_by(&self, labels: &[&str], delta: f64) {
        if delta < 0.0 {
            warn!(metric = %self.family.name, delta, "counters cannot decrease");
            return;
        }
        if let Some(key) = self.family.key(labels) {
            *self.family.samples().entry(key).or_insert(0.0) += delta;
        }
    }

    pub fn get(&self, labels: &[&str]) -> f64 {
        self.family
            .key(labels)
            .and_then(|key| self.family.samples().get(&key).copied())
            .unwrap_or(0.0)
    }
}
