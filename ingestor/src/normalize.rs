use crate::errors::{Error, Result};
use crate::model::Measurement;
use crate::validate::{parse_date_time, parse_number, ValidPayload, WireMeasurement, WireNumber};
use chrono::SubsecRound;

/// Turns a validated payload into storage records.
///
/// Batch payloads carry `deviceId`/`locationId` once; every measurement
/// inherits them. Failures here mean the validator let something through
/// and are reported as internal errors.
pub fn normalize(payload: ValidPayload) -> Result<Vec<Measurement>> {
    match payload {
        ValidPayload::Batch {
            device_id,
            location_id,
            measurements,
        } => measurements
            .into_iter()
            .map(|wire| to_record(&device_id, Some(&location_id), wire))
            .collect(),
        ValidPayload::Single {
            device_id,
            location_id,
            measurement,
        } => Ok(vec![to_record(
            &device_id,
            location_id.as_deref(),
            measurement,
        )?]),
    }
}

fn to_record(
    device_id: &str,
    location_id: Option<&str>,
    wire: WireMeasurement,
) -> Result<Measurement> {
    // Postgres keeps microseconds; anything finer would make two distinct
    // wire values collide only once stored.
    let timestamp = parse_date_time(&wire.date_time)
        .ok_or_else(|| {
            Error::Normalization(format!("unparseable dateTime {:?}", wire.date_time))
        })?
        .trunc_subsecs(6);

    Ok(Measurement {
        device_id: device_id.to_string(),
        location_id: location_id.map(str::to_string),
        timestamp,
        temperature: coerce(&wire.temperature, "temperature")?,
        humidity: wire
            .humidity
            .as_ref()
            .map(|humidity| coerce(humidity, "humidity"))
            .transpose()?,
    })
}

fn coerce(number: &WireNumber, field: &str) -> Result<f64> {
    parse_number(number)
        .ok_or_else(|| Error::Normalization(format!("{} is not numeric: {:?}", field, number)))
}
