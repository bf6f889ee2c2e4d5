use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single environmental reading as it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub device_id: String,
    pub location_id: Option<String>,
    #[serde(rename = "dateTime")]
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: Option<f64>,
}

/// Which request body layout an ingestion route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `{deviceId, locationId, measurements: [...]}`
    Batch,
    /// `{deviceId, dateTime, locationId?, temperature, humidity?}`
    Single,
}

/// Column set that identifies a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniquenessKey {
    #[default]
    TimestampDevice,
    Timestamp,
}

impl UniquenessKey {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "timestamp_device" => Some(Self::TimestampDevice),
            "timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }

    pub fn columns(self) -> &'static str {
        match self {
            Self::TimestampDevice => r#""timestamp", device_id"#,
            Self::Timestamp => r#""timestamp""#,
        }
    }
}

/// Success body for the ingestion routes
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub message: String,
}

impl IngestResponse {
    pub fn added(count: usize) -> Self {
        let noun = if count == 1 { "measurement" } else { "measurements" };
        Self {
            message: format!("{} {} added successfully", count, noun),
        }
    }
}

/// REST API response wrapper for read-back queries
#[derive(Debug, Serialize)]
pub struct MeasurementsResponse {
    pub data: Vec<Measurement>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
