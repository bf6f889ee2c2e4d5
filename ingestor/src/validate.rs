use crate::errors::{Error, Result};
use crate::model::PayloadShape;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

const BATCH_KEYS: &[&str] = &["deviceId", "locationId", "measurements"];
const MEASUREMENT_KEYS: &[&str] = &["dateTime", "temperature", "humidity"];
const SINGLE_KEYS: &[&str] = &["deviceId", "dateTime", "locationId", "temperature", "humidity"];

/// Offset layouts beyond RFC 3339, e.g. `+0200` without a colon.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"];

/// Naive layouts accepted after RFC 3339; read as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// A numeric field as it arrived on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum WireNumber {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireMeasurement {
    pub date_time: String,
    pub temperature: WireNumber,
    pub humidity: Option<WireNumber>,
}

/// A request body that passed validation, still in wire representation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidPayload {
    Batch {
        device_id: String,
        location_id: String,
        measurements: Vec<WireMeasurement>,
    },
    Single {
        device_id: String,
        location_id: Option<String>,
        measurement: WireMeasurement,
    },
}

impl ValidPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Batch { measurements, .. } => measurements.len(),
            Self::Single { .. } => 1,
        }
    }
}

/// Validates a raw request body against the given shape.
///
/// Stops at the first failure; the returned message names the offending
/// field path, e.g. `"measurements[2].temperature" must be a number`.
pub fn validate(shape: PayloadShape, body: &[u8]) -> Result<ValidPayload> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("Invalid JSON payload: {}", e)))?;
    validate_value(shape, &value)
}

pub fn validate_value(shape: PayloadShape, value: &Value) -> Result<ValidPayload> {
    let object = as_object(value, "value")?;

    match shape {
        PayloadShape::Batch => validate_batch(object),
        PayloadShape::Single => validate_single(object),
    }
}

fn validate_batch(object: &Map<String, Value>) -> Result<ValidPayload> {
    let device_id = required_string(object, "deviceId", "deviceId")?;
    let location_id = required_string(object, "locationId", "locationId")?;

    let items = match object.get("measurements") {
        None => return Err(invalid("measurements", "is required")),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid("measurements", "must be an array")),
    };
    if items.is_empty() {
        return Err(invalid("measurements", "must contain at least 1 items"));
    }

    let mut measurements = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let path = format!("measurements[{}]", index);
        let item = as_object(item, &path)?;
        let measurement = measurement_fields(item, &format!("{}.", path))?;
        reject_unknown(item, MEASUREMENT_KEYS, &format!("{}.", path))?;
        measurements.push(measurement);
    }

    reject_unknown(object, BATCH_KEYS, "")?;

    Ok(ValidPayload::Batch {
        device_id,
        location_id,
        measurements,
    })
}

fn validate_single(object: &Map<String, Value>) -> Result<ValidPayload> {
    let device_id = required_string(object, "deviceId", "deviceId")?;
    let date_time = date_time_field(object, "dateTime")?;
    let location_id = optional_string(object, "locationId", "locationId")?;
    let temperature = required_number(object, "temperature", "temperature")?;
    let humidity = optional_number(object, "humidity", "humidity")?;

    reject_unknown(object, SINGLE_KEYS, "")?;

    Ok(ValidPayload::Single {
        device_id,
        location_id,
        measurement: WireMeasurement {
            date_time,
            temperature,
            humidity,
        },
    })
}

fn measurement_fields(item: &Map<String, Value>, prefix: &str) -> Result<WireMeasurement> {
    let date_time = date_time_field(item, &format!("{}dateTime", prefix))?;
    let temperature = required_number(item, "temperature", &format!("{}temperature", prefix))?;
    let humidity = optional_number(item, "humidity", &format!("{}humidity", prefix))?;

    Ok(WireMeasurement {
        date_time,
        temperature,
        humidity,
    })
}

/// Parses an ISO-8601 date-time. Values without an offset are UTC.
pub fn parse_date_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Some(parsed) = OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(raw, format).ok())
    {
        return Some(parsed.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Reads a finite number from a JSON number or numeric string.
pub fn parse_number(number: &WireNumber) -> Option<f64> {
    let value = match number {
        WireNumber::Number(value) => *value,
        WireNumber::Text(text) => text.trim().parse::<f64>().ok()?,
    };
    value.is_finite().then_some(value)
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::Validation(format!("\"{}\" {}", path, reason))
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| invalid(path, "must be of type object"))
}

fn string_value(value: &Value, path: &str) -> Result<String> {
    match value {
        Value::String(s) if s.is_empty() => Err(invalid(path, "is not allowed to be empty")),
        Value::String(s) => Ok(s.clone()),
        _ => Err(invalid(path, "must be a string")),
    }
}

fn required_string(object: &Map<String, Value>, key: &str, path: &str) -> Result<String> {
    match object.get(key) {
        Some(value) => string_value(value, path),
        None => Err(invalid(path, "is required")),
    }
}

fn optional_string(object: &Map<String, Value>, key: &str, path: &str) -> Result<Option<String>> {
    object.get(key).map(|value| string_value(value, path)).transpose()
}

fn date_time_field(object: &Map<String, Value>, path: &str) -> Result<String> {
    let raw = required_string(object, "dateTime", path)?;
    if parse_date_time(&raw).is_none() {
        return Err(invalid(path, "must be in iso format"));
    }
    Ok(raw)
}

fn number_value(value: &Value, path: &str) -> Result<WireNumber> {
    let number = match value {
        Value::Number(n) => n.as_f64().map(WireNumber::Number),
        Value::String(s) => Some(WireNumber::Text(s.clone())),
        _ => None,
    };

    match number {
        Some(number) if parse_number(&number).is_some() => Ok(number),
        _ => Err(invalid(path, "must be a number")),
    }
}

fn required_number(object: &Map<String, Value>, key: &str, path: &str) -> Result<WireNumber> {
    match object.get(key) {
        Some(value) => number_value(value, path),
        None => Err(invalid(path, "is required")),
    }
}

fn optional_number(
    object: &Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<Option<WireNumber>> {
    object.get(key).map(|value| number_value(value, path)).transpose()
}

fn reject_unknown(object: &Map<String, Value>, allowed: &[&str], prefix: &str) -> Result<()> {
    match object.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(invalid(&format!("{}{}", prefix, key), "is not allowed")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch_error(body: Value) -> String {
        match validate_value(PayloadShape::Batch, &body) {
            Err(Error::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    fn single_error(body: Value) -> String {
        match validate_value(PayloadShape::Single, &body) {
            Err(Error::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_batch() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [
                {"dateTime": "2024-01-01T00:00:00Z", "temperature": 21.5, "humidity": 40},
                {"dateTime": "2024-01-01T00:05:00Z", "temperature": "22.0"}
            ]
        });

        let payload = validate_value(PayloadShape::Batch, &body).unwrap();
        assert_eq!(payload.len(), 2);

        match payload {
            ValidPayload::Batch {
                device_id,
                location_id,
                measurements,
            } => {
                assert_eq!(device_id, "dev1");
                assert_eq!(location_id, "loc1");
                assert_eq!(measurements[0].temperature, WireNumber::Number(21.5));
                assert_eq!(measurements[0].humidity, Some(WireNumber::Number(40.0)));
                assert_eq!(
                    measurements[1].temperature,
                    WireNumber::Text("22.0".to_string())
                );
                assert_eq!(measurements[1].humidity, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_valid_single() {
        let body = json!({
            "deviceId": "dev1",
            "dateTime": "2024-01-01T00:00:00",
            "temperature": 19.0
        });

        let payload = validate_value(PayloadShape::Single, &body).unwrap();
        match payload {
            ValidPayload::Single {
                location_id,
                measurement,
                ..
            } => {
                assert_eq!(location_id, None);
                assert_eq!(measurement.date_time, "2024-01-01T00:00:00");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_invalid_json() {
        let err = validate(PayloadShape::Batch, b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON payload"));
    }

    #[test]
    fn test_body_must_be_object() {
        assert_eq!(batch_error(json!([1, 2])), r#""value" must be of type object"#);
    }

    #[test]
    fn test_missing_device_id() {
        let body = json!({"locationId": "loc1", "measurements": []});
        assert_eq!(batch_error(body), r#""deviceId" is required"#);
    }

    #[test]
    fn test_missing_location_id_in_batch() {
        let body = json!({"deviceId": "dev1", "measurements": []});
        assert_eq!(batch_error(body), r#""locationId" is required"#);
    }

    #[test]
    fn test_empty_device_id() {
        let body = json!({"deviceId": "", "locationId": "loc1", "measurements": []});
        assert_eq!(batch_error(body), r#""deviceId" is not allowed to be empty"#);
    }

    #[test]
    fn test_null_device_id() {
        let body = json!({"deviceId": null, "locationId": "loc1", "measurements": []});
        assert_eq!(batch_error(body), r#""deviceId" must be a string"#);
    }

    #[test]
    fn test_measurements_required_and_non_empty() {
        let body = json!({"deviceId": "dev1", "locationId": "loc1"});
        assert_eq!(batch_error(body), r#""measurements" is required"#);

        let body = json!({"deviceId": "dev1", "locationId": "loc1", "measurements": []});
        assert_eq!(
            batch_error(body),
            r#""measurements" must contain at least 1 items"#
        );

        let body = json!({"deviceId": "dev1", "locationId": "loc1", "measurements": {}});
        assert_eq!(batch_error(body), r#""measurements" must be an array"#);
    }

    #[test]
    fn test_first_invalid_item_is_reported() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [
                {"dateTime": "2024-01-01T00:00:00Z", "temperature": 21.5},
                {"dateTime": "2024-01-01T00:01:00Z"},
                {"dateTime": "yesterday", "temperature": 21.5}
            ]
        });
        assert_eq!(
            batch_error(body),
            r#""measurements[1].temperature" is required"#
        );
    }

    #[test]
    fn test_missing_date_time() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"temperature": 21.5}]
        });
        assert_eq!(batch_error(body), r#""measurements[0].dateTime" is required"#);
    }

    #[test]
    fn test_date_time_must_be_iso() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "01/02/2024", "temperature": 21.5}]
        });
        assert_eq!(
            batch_error(body),
            r#""measurements[0].dateTime" must be in iso format"#
        );

        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "2024-01-01", "temperature": 21.5}]
        });
        assert_eq!(
            batch_error(body),
            r#""measurements[0].dateTime" must be in iso format"#
        );
    }

    #[test]
    fn test_non_numeric_values() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "2024-01-01T00:00:00Z", "temperature": "warm"}]
        });
        assert_eq!(
            batch_error(body),
            r#""measurements[0].temperature" must be a number"#
        );

        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "2024-01-01T00:00:00Z", "temperature": 20, "humidity": true}]
        });
        assert_eq!(
            batch_error(body),
            r#""measurements[0].humidity" must be a number"#
        );
    }

    #[test]
    fn test_non_finite_numeric_string_rejected() {
        let body = json!({"deviceId": "dev1", "dateTime": "2024-01-01T00:00:00Z", "temperature": "NaN"});
        assert_eq!(single_error(body), r#""temperature" must be a number"#);
    }

    #[test]
    fn test_item_must_be_object() {
        let body = json!({"deviceId": "dev1", "locationId": "loc1", "measurements": [42]});
        assert_eq!(
            batch_error(body),
            r#""measurements[0]" must be of type object"#
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "2024-01-01T00:00:00Z", "temperature": 1, "pressure": 1013}]
        });
        assert_eq!(
            batch_error(body),
            r#""measurements[0].pressure" is not allowed"#
        );

        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "2024-01-01T00:00:00Z", "temperature": 1}],
            "firmware": "1.2"
        });
        assert_eq!(batch_error(body), r#""firmware" is not allowed"#);
    }

    #[test]
    fn test_single_shape_rejects_batch_body() {
        let body = json!({
            "deviceId": "dev1",
            "locationId": "loc1",
            "measurements": [{"dateTime": "2024-01-01T00:00:00Z", "temperature": 1}]
        });
        assert_eq!(single_error(body), r#""dateTime" is required"#);
    }

    #[test]
    fn test_parse_date_time_variants() {
        let expected: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(parse_date_time("2024-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_date_time("2024-01-01T02:00:00+02:00"), Some(expected));
        assert_eq!(parse_date_time("2024-01-01T00:00:00.000"), Some(expected));
        assert_eq!(parse_date_time("2024-01-01T00:00"), Some(expected));
        assert_eq!(parse_date_time("2024-01-01T02:00:00+0200"), Some(expected));
        assert_eq!(parse_date_time("2023-12-31T23:00:00.000-0100"), Some(expected));
        assert_eq!(parse_date_time("not a date"), None);
    }
}
