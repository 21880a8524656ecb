//! Speedtest webhook payload and its lenient JSON decoder.
//!
//! Every field is optional on the wire: absent or `null` values decode to
//! zero / empty, unknown keys are ignored, and a repeated key keeps its last
//! value. Only malformed JSON, a top level that is not an object, or a value
//! whose JSON type cannot fit the field, is rejected.

use opentelemetry::KeyValue;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// One speedtest result as delivered by the webhook source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpeedtestResult {
    #[serde(deserialize_with = "null_as_default")]
    pub result_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub site_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub service: String,
    #[serde(rename = "serverName", deserialize_with = "null_as_default")]
    pub server_name: String,
    #[serde(rename = "serverId", deserialize_with = "null_as_default")]
    pub server_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub isp: String,
    /// Latency in milliseconds.
    #[serde(deserialize_with = "null_as_default")]
    pub ping: f64,
    /// Download throughput in bits per second.
    #[serde(deserialize_with = "null_as_default")]
    pub download: f64,
    /// Upload throughput in bits per second.
    #[serde(deserialize_with = "null_as_default")]
    pub upload: f64,
    #[serde(rename = "packetLoss", deserialize_with = "null_as_default")]
    pub packet_loss: f64,
    /// Link to the result page.
    #[serde(deserialize_with = "null_as_default")]
    pub speedtest_url: String,
    /// Link to the dashboard that sent the webhook.
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl SpeedtestResult {
    /// Dimensions attached to each histogram recording.
    pub fn metric_attributes(&self) -> [KeyValue; 3] {
        [
            KeyValue::new("server.id", self.server_id.to_string()),
            KeyValue::new("server.name", self.server_name.clone()),
            KeyValue::new("isp", self.isp.clone()),
        ]
    }

    /// Attributes of the `speedtest.result` span event.
    pub fn event_attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("result_id", self.result_id),
            KeyValue::new("site_name", self.site_name.clone()),
            KeyValue::new("service", self.service.clone()),
            KeyValue::new("server.name", self.server_name.clone()),
            KeyValue::new("server.id", self.server_id),
            KeyValue::new("isp", self.isp.clone()),
            KeyValue::new("ping", self.ping),
            KeyValue::new("download.bps", self.download),
            KeyValue::new("upload.bps", self.upload),
            KeyValue::new("packet.loss", self.packet_loss),
            KeyValue::new("speedtest.url", self.speedtest_url.clone()),
            KeyValue::new("url", self.url.clone()),
        ]
    }
}

/// Why a webhook body could not be decoded.
#[derive(Debug, thiserror::Error)]
#[error("invalid speedtest payload: {source}")]
pub struct DecodeError {
    #[from]
    source: serde_json::Error,
}

impl DecodeError {
    /// The body was not well-formed JSON.
    pub fn is_syntax(&self) -> bool {
        self.source.is_syntax()
    }

    /// The body was well-formed but a value had the wrong JSON type.
    pub fn is_data(&self) -> bool {
        self.source.is_data()
    }

    /// The body ended before the JSON value was complete.
    pub fn is_eof(&self) -> bool {
        self.source.is_eof()
    }
}

/// Decode a webhook body.
///
/// The body is read as a JSON object first. A derived struct would also
/// accept an array by position, and would reject duplicate keys.
pub fn decode(body: &[u8]) -> Result<SpeedtestResult, DecodeError> {
    let object: Map<String, Value> = serde_json::from_slice(body)?;
    Ok(SpeedtestResult::deserialize(Value::Object(object))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::Value;

    fn attr<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a Value> {
        attrs.iter().find(|kv| kv.key.as_str() == key).map(|kv| &kv.value)
    }

    fn text(attrs: &[KeyValue], key: &str) -> Option<String> {
        attr(attrs, key).map(|v| v.as_str().into_owned())
    }

    #[test]
    fn test_decode_full_payload() {
        let body = br#"{
            "result_id": 123,
            "site_name": "Home",
            "service": "ookla",
            "serverName": "Test Server",
            "serverId": 456,
            "isp": "Example ISP",
            "ping": 25.5,
            "download": 100000000,
            "upload": 50000000,
            "packetLoss": 0.5,
            "speedtest_url": "https://www.speedtest.net/result/c/abc",
            "url": "https://speedtest.local"
        }"#;

        let result = decode(body).unwrap();
        assert_eq!(result.result_id, 123);
        assert_eq!(result.site_name, "Home");
        assert_eq!(result.service, "ookla");
        assert_eq!(result.server_name, "Test Server");
        assert_eq!(result.server_id, 456);
        assert_eq!(result.isp, "Example ISP");
        assert_eq!(result.ping, 25.5);
        assert_eq!(result.download, 100_000_000.0);
        assert_eq!(result.upload, 50_000_000.0);
        assert_eq!(result.packet_loss, 0.5);
        assert_eq!(result.speedtest_url, "https://www.speedtest.net/result/c/abc");
        assert_eq!(result.url, "https://speedtest.local");
    }

    #[test]
    fn test_empty_object_decodes_to_defaults() {
        assert_eq!(decode(b"{}").unwrap(), SpeedtestResult::default());
    }

    #[test]
    fn test_nulls_and_unknown_keys_are_tolerated() {
        let result =
            decode(br#"{"ping": null, "isp": null, "serverId": 7, "extra": [1, 2]}"#).unwrap();
        assert_eq!(result.ping, 0.0);
        assert_eq!(result.isp, "");
        assert_eq!(result.server_id, 7);
    }

    #[test]
    fn test_malformed_json_is_syntax_error() {
        let err = decode(b"not json").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_truncated_json_is_eof_error() {
        let err = decode(br#"{"ping": 25"#).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_wrong_value_type_is_data_error() {
        let err = decode(br#"{"ping": "fast"}"#).unwrap_err();
        assert!(err.is_data());
    }

    #[test]
    fn test_top_level_array_is_data_error() {
        for body in [&b"[]"[..], b"[1]", br#"[5, "site", "svc"]"#] {
            let err = decode(body).unwrap_err();
            assert!(err.is_data(), "{:?} should be rejected", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn test_top_level_scalar_is_data_error() {
        assert!(decode(b"42").unwrap_err().is_data());
        assert!(decode(b"null").unwrap_err().is_data());
    }

    #[test]
    fn test_duplicate_key_keeps_last_value() {
        let result = decode(br#"{"ping": 1.0, "serverId": 3, "ping": 2.0}"#).unwrap();
        assert_eq!(result.ping, 2.0);
        assert_eq!(result.server_id, 3);
    }

    #[test]
    fn test_metric_attributes() {
        let result = SpeedtestResult {
            server_id: 456,
            server_name: "Test Server".into(),
            isp: "Example ISP".into(),
            ..Default::default()
        };

        let attrs = result.metric_attributes();
        assert_eq!(text(&attrs, "server.id").as_deref(), Some("456"));
        assert_eq!(text(&attrs, "server.name").as_deref(), Some("Test Server"));
        assert_eq!(text(&attrs, "isp").as_deref(), Some("Example ISP"));
    }

    #[test]
    fn test_event_attributes_carry_measurements() {
        let result = SpeedtestResult {
            result_id: 9,
            ping: 12.0,
            download: 1e6,
            upload: 2e6,
            packet_loss: 0.1,
            ..Default::default()
        };

        let attrs = result.event_attributes();
        assert_eq!(attr(&attrs, "result_id"), Some(&Value::I64(9)));
        assert_eq!(attr(&attrs, "ping"), Some(&Value::F64(12.0)));
        assert_eq!(attr(&attrs, "download.bps"), Some(&Value::F64(1e6)));
        assert_eq!(attr(&attrs, "upload.bps"), Some(&Value::F64(2e6)));
        assert_eq!(attr(&attrs, "packet.loss"), Some(&Value::F64(0.1)));
    }
}
