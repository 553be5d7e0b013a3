//! Built-in detector variants.
//!
//! Packages pick one of these by name through their manifest's `variant`, so the
//! host never needs compile-time knowledge of a particular package.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use super::loader::LoaderError;
use super::traits::{Detector, DetectorError, DetectorServices};
use crate::domain::{
    Alert, AlertSeverity, ResolutionCheckRequest, ResolutionState, ResourceIdentifier,
    ResourceType, TimeRange,
};
use crate::resilience::DependencyTrace;

pub const NOOP: &str = "noop";
pub const RESOURCE_INVENTORY: &str = "resource-inventory";
pub const THRESHOLD: &str = "threshold";

/// Setting that overrides a variant's supported resource type.
pub const RESOURCE_TYPE_SETTING: &str = "resource_type";

type Factory = fn(String, ResourceType) -> Arc<dyn Detector>;

struct Variant {
    default_resource_type: ResourceType,
    factory: Factory,
}

/// Closed set of detector variants keyed by name.
pub struct BuiltinRegistry {
    variants: BTreeMap<&'static str, Variant>,
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        let mut variants = BTreeMap::new();
        variants.insert(
            NOOP,
            Variant {
                default_resource_type: ResourceType::Subscription,
                factory: |id, resource_type| Arc::new(NoopDetector { id, resource_type }),
            },
        );
        variants.insert(
            RESOURCE_INVENTORY,
            Variant {
                default_resource_type: ResourceType::ResourceGroup,
                factory: |id, resource_type| {
                    Arc::new(ResourceInventoryDetector { id, resource_type })
                },
            },
        );
        variants.insert(
            THRESHOLD,
            Variant {
                default_resource_type: ResourceType::VirtualMachine,
                factory: |id, resource_type| Arc::new(ThresholdDetector { id, resource_type }),
            },
        );
        Self { variants }
    }
}

impl BuiltinRegistry {
    pub fn contains(&self, variant: &str) -> bool {
        self.variants.contains_key(variant)
    }

    pub fn variants(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.variants.keys().copied()
    }

    /// Instantiate `variant` under the detector id `id`.
    pub fn create(
        &self,
        variant: &str,
        id: &str,
        settings: &Map<String, Value>,
    ) -> Result<Arc<dyn Detector>, LoaderError> {
        let entry = self
            .variants
            .get(variant)
            .ok_or_else(|| LoaderError::NotFound(format!("unknown detector variant '{variant}'")))?;

        let resource_type = match settings.get(RESOURCE_TYPE_SETTING) {
            None => entry.default_resource_type,
            Some(Value::String(raw)) => ResourceType::from_str(raw).map_err(|_| {
                LoaderError::Load(format!("detector '{id}' has unknown resource type '{raw}'"))
            })?,
            Some(other) => {
                return Err(LoaderError::Load(format!(
                    "detector '{id}' has a non-string resource type: {other}"
                )));
            }
        };

        Ok((entry.factory)(id.to_string(), resource_type))
    }
}

/// Never raises anything.
struct NoopDetector {
    id: String,
    resource_type: ResourceType,
}

#[async_trait]
impl Detector for NoopDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_resource_type(&self) -> ResourceType {
        self.resource_type
    }

    async fn analyze(
        &self,
        _resources: &[ResourceIdentifier],
        _time_range: &TimeRange,
        _services: &DetectorServices,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Alert>, DetectorError> {
        Ok(Vec::new())
    }

    async fn check_resolution(
        &self,
        _request: &ResolutionCheckRequest,
        _services: &DetectorServices,
        _cancel: &CancellationToken,
    ) -> Result<ResolutionState, DetectorError> {
        Ok(ResolutionState {
            is_resolved: true,
            properties: Map::new(),
        })
    }
}

/// One informational finding per resource.
struct ResourceInventoryDetector {
    id: String,
    resource_type: ResourceType,
}

#[async_trait]
impl Detector for ResourceInventoryDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_resource_type(&self) -> ResourceType {
        self.resource_type
    }

    async fn analyze(
        &self,
        resources: &[ResourceIdentifier],
        time_range: &TimeRange,
        _services: &DetectorServices,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>, DetectorError> {
        let mut alerts = Vec::with_capacity(resources.len());
        for resource in resources {
            if cancel.is_cancelled() {
                return Err(DetectorError::Cancelled);
            }
            let mut properties = Map::new();
            properties.insert("resource_id".to_string(), json!(resource.to_string()));
            properties.insert("window_start".to_string(), json!(time_range.start));
            properties.insert("window_end".to_string(), json!(time_range.end));
            alerts.push(Alert {
                title: format!("Inventory: {resource}"),
                resource: resource.clone(),
                severity: AlertSeverity::Informational,
                properties,
            });
        }
        Ok(alerts)
    }

    async fn check_resolution(
        &self,
        request: &ResolutionCheckRequest,
        _services: &DetectorServices,
        _cancel: &CancellationToken,
    ) -> Result<ResolutionState, DetectorError> {
        let mut properties = Map::new();
        properties.insert("resource_id".to_string(), json!(request.resource.to_string()));
        Ok(ResolutionState {
            is_resolved: false,
            properties,
        })
    }
}

/// Alerts when a per-resource value exceeds a threshold.
///
/// Settings: `threshold` (number, required), `values` (object keyed by resource id
/// or resource name), `severity` (optional, default `medium`). A missing `values`
/// object means the metric source is unavailable, which is transient.
struct ThresholdDetector {
    id: String,
    resource_type: ResourceType,
}

const METRIC_SOURCE: &str = "metric-source";

impl ThresholdDetector {
    fn threshold(settings: &Map<String, Value>) -> Result<f64, DetectorError> {
        settings
            .get("threshold")
            .and_then(Value::as_f64)
            .ok_or_else(|| DetectorError::fault("'threshold' setting must be a number"))
    }

    fn severity(settings: &Map<String, Value>) -> Result<AlertSeverity, DetectorError> {
        match settings.get("severity").and_then(Value::as_str) {
            None => Ok(AlertSeverity::Medium),
            Some(raw) => AlertSeverity::from_str(raw)
                .map_err(|_| DetectorError::fault(format!("unknown severity '{raw}'"))),
        }
    }

    /// Read the metric values, tracing the lookup as a dependency call.
    fn values<'a>(
        services: &'a DetectorServices,
        requested: usize,
    ) -> Result<&'a Map<String, Value>, DetectorError> {
        let started = Instant::now();
        let values = services.settings.get("values").and_then(Value::as_object);
        let trace = DependencyTrace::new(METRIC_SOURCE, started.elapsed(), values.is_some())
            .with_metric("resources", requested as f64);
        services.tracer.trace(&trace);
        values.ok_or_else(|| DetectorError::transient("metric source unavailable"))
    }

    fn value_for(values: &Map<String, Value>, resource: &ResourceIdentifier) -> Option<f64> {
        values
            .get(&resource.to_string())
            .or_else(|| resource.name.as_deref().and_then(|name| values.get(name)))
            .and_then(Value::as_f64)
    }
}

#[async_trait]
impl Detector for ThresholdDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_resource_type(&self) -> ResourceType {
        self.resource_type
    }

    async fn analyze(
        &self,
        resources: &[ResourceIdentifier],
        _time_range: &TimeRange,
        services: &DetectorServices,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>, DetectorError> {
        let threshold = Self::threshold(&services.settings)?;
        let severity = Self::severity(&services.settings)?;
        let values = Self::values(services, resources.len())?;

        let mut alerts = Vec::new();
        for resource in resources {
            if cancel.is_cancelled() {
                return Err(DetectorError::Cancelled);
            }
            let Some(value) = Self::value_for(values, resource) else {
                continue;
            };
            if value > threshold {
                let mut properties = Map::new();
                properties.insert("value".to_string(), json!(value));
                properties.insert("threshold".to_string(), json!(threshold));
                alerts.push(Alert {
                    title: format!("{} above {threshold}: {value}", self.id),
                    resource: resource.clone(),
                    severity,
                    properties,
                });
            }
        }
        Ok(alerts)
    }

    async fn check_resolution(
        &self,
        request: &ResolutionCheckRequest,
        services: &DetectorServices,
        _cancel: &CancellationToken,
    ) -> Result<ResolutionState, DetectorError> {
        let threshold = Self::threshold(&services.settings)?;
        let values = Self::values(services, 1)?;
        let value = Self::value_for(values, &request.resource).ok_or_else(|| {
            DetectorError::transient(format!("no value reported for {}", request.resource))
        })?;

        let mut properties = Map::new();
        properties.insert("value".to_string(), json!(value));
        properties.insert("threshold".to_string(), json!(threshold));
        Ok(ResolutionState {
            is_resolved: value <= threshold,
            properties,
        })
    }
}
