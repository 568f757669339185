//! Adaptive TTL engine.
//!
//! Scores an entry from access frequency, recency and the resource type's
//! stability, then scales the policy default TTL by that score. The three
//! weights are tuned from efficiency reports.

use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::keys::ResourceType;
use super::lock::{rw_read, rw_write};
use super::monitor::{EfficiencyReport, ReportStatus};
use super::tracker::AccessRecord;

const SOURCE: &str = "cache::ttl";

pub const DEFAULT_FREQUENCY_WEIGHT: f64 = 0.5;
pub const DEFAULT_RECENCY_WEIGHT: f64 = 0.3;
pub const DEFAULT_VOLATILITY_WEIGHT: f64 = 0.2;

/// Relative importance of each TTL signal. Always within [0, 1] and summing to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtlWeights {
    pub frequency: f64,
    pub recency: f64,
    pub volatility: f64,
}

impl Default for TtlWeights {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY_WEIGHT,
            recency: DEFAULT_RECENCY_WEIGHT,
            volatility: DEFAULT_VOLATILITY_WEIGHT,
        }
    }
}

impl TtlWeights {
    /// Clamp each weight into [0, 1] and rescale to sum 1; all-zero becomes the defaults.
    pub fn normalized(self) -> Self {
        let clamp = |value: f64| {
            if value.is_finite() {
                value.clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        let (frequency, recency, volatility) = (
            clamp(self.frequency),
            clamp(self.recency),
            clamp(self.volatility),
        );
        let sum = frequency + recency + volatility;
        if sum <= f64::EPSILON {
            return Self::default();
        }
        Self {
            frequency: frequency / sum,
            recency: recency / sum,
            volatility: volatility / sum,
        }
    }

    pub fn is_valid(&self) -> bool {
        let in_range = |value: f64| (0.0..=1.0).contains(&value);
        in_range(self.frequency)
            && in_range(self.recency)
            && in_range(self.volatility)
            && (self.frequency + self.recency + self.volatility - 1.0).abs() < 1e-9
    }
}

/// Change applied by one tuning step.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WeightsDelta {
    pub frequency: f64,
    pub recency: f64,
    pub volatility: f64,
}

impl WeightsDelta {
    fn between(before: TtlWeights, after: TtlWeights) -> Self {
        Self {
            frequency: after.frequency - before.frequency,
            recency: after.recency - before.recency,
            volatility: after.volatility - before.volatility,
        }
    }
}

/// Result of `auto_tune_weights`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneOutcome {
    pub success: bool,
    pub weights: TtlWeights,
    pub delta: WeightsDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Resource types that moved the weights.
    pub adjustments: Vec<String>,
}

#[derive(Debug, Error)]
pub enum WeightsFileError {
    #[error("failed to access weights file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid weights file: {0}")]
    Codec(#[from] serde_json::Error),
}

static SHARED: Lazy<Arc<AdaptiveTtl>> =
    Lazy::new(|| Arc::new(AdaptiveTtl::new(Arc::new(CacheConfig::default()))));

/// TTL calculator owning one set of weights.
pub struct AdaptiveTtl {
    config: Arc<CacheConfig>,
    weights: RwLock<TtlWeights>,
}

impl AdaptiveTtl {
    pub fn new(config: Arc<CacheConfig>) -> Self {
        Self::with_weights(config, TtlWeights::default())
    }

    pub fn with_weights(config: Arc<CacheConfig>, weights: TtlWeights) -> Self {
        Self {
            config,
            weights: RwLock::new(weights.normalized()),
        }
    }

    /// Process-wide engine with default configuration.
    pub fn shared() -> Arc<AdaptiveTtl> {
        Arc::clone(&SHARED)
    }

    pub fn weights(&self) -> TtlWeights {
        *rw_read(&self.weights, SOURCE, "weights")
    }

    /// TTL in seconds for an entry of `resource_type`, evaluated now.
    pub fn compute_ttl(&self, resource_type: &ResourceType, record: Option<&AccessRecord>) -> u64 {
        self.compute_ttl_at(resource_type, record, OffsetDateTime::now_utc())
    }

    /// TTL in seconds evaluated at `now`. Without a record both access signals are zero.
    pub fn compute_ttl_at(
        &self,
        resource_type: &ResourceType,
        record: Option<&AccessRecord>,
        now: OffsetDateTime,
    ) -> u64 {
        let policy = self.config.policy_for(resource_type);
        let tuning = &self.config.ttl;
        let weights = self.weights();

        let (frequency, recency) = match record {
            Some(record) => {
                let saturation = (1.0 + tuning.frequency_saturation as f64).ln();
                let frequency = ((1.0 + record.hit_count as f64).ln() / saturation).min(1.0);
                let since = (now - record.last_access).as_seconds_f64().max(0.0);
                let recency = 1.0 / (1.0 + since / tuning.recency_half_life_secs as f64);
                (frequency, recency)
            }
            None => (0.0, 0.0),
        };
        let stability = 1.0 - policy.volatility;

        let score = (weights.frequency * frequency
            + weights.recency * recency
            + weights.volatility * stability)
            .clamp(0.0, 1.0);
        let multiplier =
            tuning.min_multiplier + (tuning.max_multiplier - tuning.min_multiplier) * score;
        let ttl = (policy.default_ttl_secs as f64 * multiplier).round();

        let ttl = if ttl.is_finite() && ttl > 0.0 {
            ttl as u64
        } else {
            policy.min_ttl_secs
        };
        ttl.clamp(policy.min_ttl_secs, policy.max_ttl_secs)
    }

    /// One tuning step driven by `report`. Never fails; `success` is false without data.
    pub fn auto_tune_weights(&self, report: &EfficiencyReport) -> TuneOutcome {
        let tuning = &self.config.ttl;
        let before = self.weights();

        if report.status != ReportStatus::Ok {
            return TuneOutcome {
                success: false,
                weights: before,
                delta: WeightsDelta::default(),
                reason: Some(
                    report
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("report status is {}", report.status.as_str())),
                ),
                adjustments: Vec::new(),
            };
        }

        let eligible: Vec<_> = report
            .per_resource_type
            .iter()
            .filter(|(_, stats)| stats.sample_count >= tuning.min_samples)
            .collect();
        if eligible.is_empty() {
            return TuneOutcome {
                success: false,
                weights: before,
                delta: WeightsDelta::default(),
                reason: Some(format!(
                    "no resource type has at least {} samples",
                    tuning.min_samples
                )),
                adjustments: Vec::new(),
            };
        }

        let mut weights = rw_write(&self.weights, SOURCE, "auto_tune_weights");
        let mut adjustments = Vec::new();
        for (resource_type, stats) in eligible {
            let step = if stats.hit_ratio < tuning.target_hit_ratio {
                -tuning.step
            } else if stats.hit_ratio > tuning.upper_hit_ratio && stats.churn < tuning.churn_threshold {
                tuning.step
            } else {
                continue;
            };

            *weights = TtlWeights {
                frequency: weights.frequency + step,
                recency: weights.recency - step,
                volatility: weights.volatility,
            }
            .normalized();
            debug!(
                resource_type = %resource_type,
                hit_ratio = stats.hit_ratio,
                churn = stats.churn,
                step,
                "ttl weights adjusted"
            );
            adjustments.push(resource_type.clone());
        }
        let after = *weights;
        drop(weights);

        info!(
            frequency = after.frequency,
            recency = after.recency,
            volatility = after.volatility,
            adjusted = adjustments.len(),
            "ttl weights tuned"
        );

        TuneOutcome {
            success: true,
            weights: after,
            delta: WeightsDelta::between(before, after),
            reason: None,
            adjustments,
        }
    }

    /// Restore the default weights.
    pub fn reset_weights(&self) -> TtlWeights {
        let defaults = TtlWeights::default();
        *rw_write(&self.weights, SOURCE, "reset_weights") = defaults;
        info!("ttl weights reset to defaults");
        defaults
    }

    /// Replace the weights from a JSON snapshot. A missing file keeps the current weights.
    pub fn load_weights(&self, path: &Path) -> Result<Option<TtlWeights>, WeightsFileError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted ttl weights");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let loaded: TtlWeights = serde_json::from_slice(&raw)?;
        let weights = loaded.normalized();
        if weights != loaded {
            warn!(path = %path.display(), "persisted ttl weights were out of range and were normalized");
        }
        *rw_write(&self.weights, SOURCE, "load_weights") = weights;
        info!(path = %path.display(), "ttl weights loaded");
        Ok(Some(weights))
    }

    /// Write the current weights as JSON, replacing the file atomically.
    pub fn persist_weights(&self, path: &Path) -> Result<(), WeightsFileError> {
        let weights = self.weights();
        let encoded = serde_json::to_vec_pretty(&weights)?;

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, encoded)?;
        std::fs::rename(&staging, path)?;
        debug!(path = %path.display(), "ttl weights persisted");
        Ok(())
    }
}
