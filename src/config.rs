//! Operator configuration
//!
//! Every setting is a command-line flag that can also be supplied through the
//! environment, so the same binary runs locally and from a Deployment.

use std::time::Duration;

use clap::Args;

use crate::telemetry::TelemetryConfig;
use crate::{
    CONTROLLER_NAME, DEFAULT_INVENTORY_REFRESH_SECS, DEFAULT_PENDING_REQUEUE_SECS,
    DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START,
};

/// Runtime settings for the workload controller
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// First host port handed to workers
    #[arg(long, env = "GPUFLEET_PORT_RANGE_START", default_value_t = DEFAULT_PORT_RANGE_START)]
    pub port_range_start: u16,

    /// Last host port handed to workers (inclusive)
    #[arg(long, env = "GPUFLEET_PORT_RANGE_END", default_value_t = DEFAULT_PORT_RANGE_END)]
    pub port_range_end: u16,

    /// Seconds to wait before re-checking terminating workers or retrying allocation
    #[arg(long, env = "GPUFLEET_PENDING_REQUEUE_SECS", default_value_t = DEFAULT_PENDING_REQUEUE_SECS)]
    pub pending_requeue_secs: u64,

    /// Seconds between refreshes of the GPU inventory
    #[arg(long, env = "GPUFLEET_INVENTORY_REFRESH_SECS", default_value_t = DEFAULT_INVENTORY_REFRESH_SECS)]
    pub inventory_refresh_secs: u64,

    /// Field manager and event reporter name
    #[arg(long, env = "GPUFLEET_FIELD_MANAGER", default_value = CONTROLLER_NAME)]
    pub field_manager: String,

    /// OTLP collector endpoint; traces and metrics stay local when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Service name reported to the collector
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "gpufleet-operator")]
    pub service_name: String,

    /// Log human-readable text instead of JSON
    #[arg(long, env = "GPUFLEET_TEXT_LOGS")]
    pub text_logs: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            pending_requeue_secs: DEFAULT_PENDING_REQUEUE_SECS,
            inventory_refresh_secs: DEFAULT_INVENTORY_REFRESH_SECS,
            field_manager: CONTROLLER_NAME.to_string(),
            otlp_endpoint: None,
            service_name: "gpufleet-operator".to_string(),
            text_logs: false,
        }
    }
}

impl OperatorConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(crate::Error::validation(format!(
                "invalid host port range {}-{}",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.pending_requeue_secs == 0 {
            return Err(crate::Error::validation(
                "pending requeue delay must be at least 1s",
            ));
        }
        if self.inventory_refresh_secs == 0 {
            return Err(crate::Error::validation(
                "inventory refresh interval must be at least 1s",
            ));
        }
        Ok(())
    }

    /// Delay before re-checking terminating workers or retrying allocation
    pub fn pending_requeue(&self) -> Duration {
        Duration::from_secs(self.pending_requeue_secs)
    }

    /// Interval between GPU inventory refreshes
    pub fn inventory_refresh(&self) -> Duration {
        Duration::from_secs(self.inventory_refresh_secs)
    }

    /// Telemetry settings derived from this configuration
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.service_name.clone(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            json_logs: !self.text_logs,
        }
    }
}
