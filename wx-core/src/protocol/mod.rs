//! Newline-delimited JSON protocol: one JSON object per frame, four
//! message shapes. Parsing is two-phase -- discriminate on `type`, then
//! decode into the concrete shape -- so that an unknown `type` produces a
//! typed error rather than a generic deserialize failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::Metrics;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Identify { zipcode: String, city: String },
    Metrics { timestamp: DateTime<Utc>, data: Metrics },
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Identified,
    Alive,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerAck {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerAck {
    pub fn identified() -> Self {
        Self { kind: "ack", status: AckStatus::Identified, message: None }
    }

    pub fn alive() -> Self {
        Self { kind: "ack", status: AckStatus::Alive, message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { kind: "ack", status: AckStatus::Error, message: Some(message.into()) }
    }

    /// Encode as a single newline-terminated frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).expect("ServerAck always serializes");
        bytes.push(b'\n');
        bytes
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct IdentifyBody {
    #[serde(default)]
    zipcode: String,
    #[serde(default)]
    city: String,
}

#[derive(Debug, Deserialize)]
struct MetricsBody {
    data: MetricsData,
}

#[derive(Debug, Deserialize)]
struct MetricsData {
    timestamp: String,
    #[serde(flatten)]
    metrics: Metrics,
}

/// Parse one frame's raw bytes (without the trailing newline) into a
/// `ClientMessage`. Embedded newlines are not valid JSON objects under
/// this framing and will fail to parse as a single object.
pub fn parse(frame: &[u8]) -> Result<ClientMessage, Error> {
    let envelope: Envelope = serde_json::from_slice(frame)
        .map_err(|e| Error::InvalidFrame(format!("malformed JSON: {e}")))?;

    match envelope.kind.as_str() {
        "identify" => {
            let body: IdentifyBody = serde_json::from_slice(frame)
                .map_err(|e| Error::InvalidFrame(format!("malformed identify: {e}")))?;
            if body.zipcode.is_empty() || body.city.is_empty() {
                return Err(Error::Identify("zipcode and city are required".into()));
            }
            Ok(ClientMessage::Identify { zipcode: body.zipcode, city: body.city })
        }
        "metrics" => {
            let body: MetricsBody = serde_json::from_slice(frame)
                .map_err(|e| Error::InvalidFrame(format!("malformed metrics: {e}")))?;
            let timestamp = DateTime::parse_from_rfc3339(&body.data.timestamp)
                .map_err(|e| Error::InvalidFrame(format!("bad timestamp: {e}")))?
                .with_timezone(&Utc);
            Ok(ClientMessage::Metrics { timestamp, data: body.data.metrics })
        }
        "keepalive" => Ok(ClientMessage::Keepalive),
        other => Err(Error::InvalidFrame(format!("unknown message type: {other}"))),
    }
}

/// Encode a client message back into a single newline-terminated frame.
/// Used by tests to exercise the parse(encode(M)) = M property law, and
/// by any future synthetic traffic generators.
pub fn encode(msg: &ClientMessage) -> Vec<u8> {
    let value = match msg {
        ClientMessage::Identify { zipcode, city } => serde_json::json!({
            "type": "identify",
            "zipcode": zipcode,
            "city": city,
        }),
        ClientMessage::Metrics { timestamp, data } => serde_json::json!({
            "type": "metrics",
            "data": {
                "timestamp": timestamp.to_rfc3339(),
                "temperature": data.temperature,
                "humidity": data.humidity,
                "precipitation": data.precipitation,
                "wind_speed": data.wind_speed,
                "wind_direction": data.wind_direction,
                "pollution": data.pollution,
                "pollen": data.pollen,
            },
        }),
        ClientMessage::Keepalive => serde_json::json!({ "type": "keepalive" }),
    };
    let mut bytes = serde_json::to_vec(&value).expect("ClientMessage always serializes");
    bytes.push(b'\n');
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WindDirection;

    fn strip_newline(mut b: Vec<u8>) -> Vec<u8> {
        assert_eq!(b.pop(), Some(b'\n'));
        b
    }

    #[test]
    fn parses_identify() {
        let frame = br#"{"type":"identify","zipcode":"90210","city":"Beverly Hills"}"#;
        let msg = parse(frame).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Identify { zipcode: "90210".into(), city: "Beverly Hills".into() }
        );
    }

    #[test]
    fn rejects_identify_missing_fields() {
        let frame = br#"{"type":"identify","zipcode":""}"#;
        assert!(matches!(parse(frame), Err(Error::Identify(_))));
    }

    #[test]
    fn parses_metrics_with_unknown_fields_ignored() {
        let frame = br#"{"type":"metrics","data":{"timestamp":"2025-10-26T13:30:00Z","temperature":25.3,"bogus_field":1}}"#;
        let msg = parse(frame).unwrap();
        match msg {
            ClientMessage::Metrics { data, .. } => assert_eq!(data.temperature, Some(25.3)),
            _ => panic!("expected metrics"),
        }
    }

    #[test]
    fn rejects_metrics_with_bad_timestamp() {
        let frame = br#"{"type":"metrics","data":{"timestamp":"not-a-date"}}"#;
        assert!(parse(frame).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let frame = br#"{"type":"ping"}"#;
        assert!(parse(frame).is_err());
    }

    #[test]
    fn parses_keepalive() {
        let frame = br#"{"type":"keepalive"}"#;
        assert_eq!(parse(frame).unwrap(), ClientMessage::Keepalive);
    }

    #[test]
    fn roundtrips_identify_and_metrics() {
        let identify = ClientMessage::Identify { zipcode: "10001".into(), city: "NYC".into() };
        let encoded = strip_newline(encode(&identify));
        assert_eq!(parse(&encoded).unwrap(), identify);

        let metrics = ClientMessage::Metrics {
            timestamp: DateTime::parse_from_rfc3339("2025-10-26T13:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            data: Metrics {
                temperature: Some(25.3),
                humidity: Some(62.5),
                precipitation: Some(0.0),
                wind_speed: Some(15.2),
                wind_direction: Some(WindDirection::NW),
                pollution: Some(45.0),
                pollen: Some(3.2),
            },
        };
        let encoded = strip_newline(encode(&metrics));
        assert_eq!(parse(&encoded).unwrap(), metrics);
    }

    #[test]
    fn ack_encodes_with_trailing_newline() {
        let bytes = ServerAck::identified().encode();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        let s = std::str::from_utf8(&bytes).unwrap();
        assert!(s.contains("\"status\":\"identified\""));
    }
}
