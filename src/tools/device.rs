//! Device telemetry cache, simulator and the two device tools.
//!
//! [`DeviceCache`] stands in for the plant gateway's live-value store: the
//! simulator (or a real gateway feed) writes readings, `device_status`
//! reads them, and `control_device` queues a command for the gateway to
//! pick up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iiot_assistant_core::capability::{TOOL_CONTROL_DEVICE, TOOL_DEVICE_STATUS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{required_str, Tool, ToolContext};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub status: String,
    /// Degrees Celsius, one decimal.
    pub temperature: f64,
    /// mm/s, two decimals.
    pub vibration: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DeviceEntry {
    reading: Option<DeviceReading>,
    pending_command: Option<String>,
}

/// Shared live-value store keyed by device id.
#[derive(Clone, Default)]
pub struct DeviceCache {
    inner: Arc<RwLock<HashMap<String, DeviceEntry>>>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, device_id: &str, reading: DeviceReading) {
        let mut map = self.inner.write().await;
        map.entry(device_id.to_string()).or_default().reading = Some(reading);
    }

    /// Latest reading. Ids match case-insensitively.
    pub async fn reading(&self, device_id: &str) -> Option<(String, DeviceReading)> {
        let map = self.inner.read().await;
        map.iter()
            .filter(|(id, _)| id.eq_ignore_ascii_case(device_id))
            .find_map(|(id, entry)| entry.reading.clone().map(|r| (id.clone(), r)))
    }

    pub async fn queue_command(&self, device_id: &str, command: &str) {
        let mut map = self.inner.write().await;
        let key = map
            .keys()
            .find(|id| id.eq_ignore_ascii_case(device_id))
            .cloned()
            .unwrap_or_else(|| device_id.to_string());
        map.entry(key).or_default().pending_command = Some(command.to_string());
    }

    pub async fn pending_command(&self, device_id: &str) -> Option<String> {
        let map = self.inner.read().await;
        map.iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(device_id))
            .and_then(|(_, entry)| entry.pending_command.clone())
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let map = self.inner.read().await;
        let mut ids: Vec<String> = map
            .iter()
            .filter(|(_, entry)| entry.reading.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// One simulated sample: 40–60 °C, vibration 0.5–3.0 mm/s, and a ~4%
/// chance of a `Warning` status.
pub fn simulate_reading(rng: &mut impl Rng) -> DeviceReading {
    let temperature = rng.gen_range(40.0..60.0_f64);
    let vibration = rng.gen_range(0.5..3.0_f64);
    let status = if rng.gen_range(0..100) > 95 {
        "Warning"
    } else {
        "Running"
    };
    DeviceReading {
        status: status.to_string(),
        temperature: (temperature * 10.0).round() / 10.0,
        vibration: (vibration * 100.0).round() / 100.0,
        updated_at: Utc::now(),
    }
}

/// Refresh every device once per `interval` until `cancel` fires.
pub fn spawn_simulator(
    cache: DeviceCache,
    devices: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(devices = devices.len(), ?interval, "device simulator started");
        let mut rng = StdRng::from_entropy();
        loop {
            for device in &devices {
                let reading = simulate_reading(&mut rng);
                cache.record(device, reading).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("device simulator stopped");
    })
}

pub struct DeviceStatusTool {
    cache: DeviceCache,
}

impl DeviceStatusTool {
    pub fn new(cache: DeviceCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Tool for DeviceStatusTool {
    fn name(&self) -> &str {
        TOOL_DEVICE_STATUS
    }

    fn description(&self) -> &str {
        "Get the current live status, temperature and vibration of an industrial device."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "deviceId": { "type": "string", "description": "Device id, e.g. Motor-01, Pump-01" }
            },
            "required": ["deviceId"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<String> {
        let device_id = required_str(&params, "deviceId")?;
        match self.cache.reading(device_id).await {
            Some((id, r)) => Ok(format!(
                "Device {} live data: status [{}], temperature [{:.1} °C], vibration [{:.2} mm/s].",
                id, r.status, r.temperature, r.vibration
            )),
            None => Ok(format!(
                "No live data cached for device {device_id}. Check that the device is online and the id is correct."
            )),
        }
    }
}

pub struct ControlDeviceTool {
    cache: DeviceCache,
}

impl ControlDeviceTool {
    pub fn new(cache: DeviceCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Tool for ControlDeviceTool {
    fn name(&self) -> &str {
        TOOL_CONTROL_DEVICE
    }

    fn description(&self) -> &str {
        "Send a control command such as Restart, Stop or Start to a device."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "deviceId": { "type": "string", "description": "Device id, e.g. Motor-01" },
                "command": { "type": "string", "description": "Control command, e.g. Restart, Stop, Start" }
            },
            "required": ["deviceId", "command"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<String> {
        let device_id = required_str(&params, "deviceId")?;
        let command = required_str(&params, "command")?;
        self.cache.queue_command(device_id, command).await;
        tracing::info!(device = %device_id, %command, "device command queued");
        Ok(format!("Queued {command} command for device {device_id}."))
    }
}
