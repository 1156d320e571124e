use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

/// One decoded frame of the feed.
///
/// The payload is kept as an untyped JSON value; the stream layer only looks
/// at the `warning` and `disconnect` control fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Message(Value);

impl Message {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes).map(Self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Looks up a top-level field of an object message.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Raw `warning` field, present when the server reports degradation.
    pub fn warning(&self) -> Option<&Value> {
        self.get("warning")
    }

    /// Raw `disconnect` field, present when the server is ending the stream.
    pub fn disconnect(&self) -> Option<&Value> {
        self.get("disconnect")
    }

    /// Typed view of the control marker carried by this message, if any.
    pub fn control(&self) -> Option<ControlMarker> {
        if let Some(raw) = self.warning() {
            let warning = StallWarning::deserialize(raw).unwrap_or_else(|_| StallWarning {
                message: Some(raw.to_string()),
                ..StallWarning::default()
            });
            return Some(ControlMarker::Warning(warning));
        }
        if let Some(raw) = self.disconnect() {
            let notice = DisconnectNotice::deserialize(raw).unwrap_or_else(|_| DisconnectNotice {
                reason: Some(raw.to_string()),
                ..DisconnectNotice::default()
            });
            return Some(ControlMarker::Disconnect(notice));
        }
        None
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Server-side control notice embedded in the feed.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMarker {
    /// The server is degraded or the client is falling behind.
    Warning(StallWarning),
    /// The server terminated the stream.
    Disconnect(DisconnectNotice),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StallWarning {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percent_full: Option<u8>,
}

impl fmt::Display for StallWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.code.as_deref().unwrap_or("WARNING"),
            self.message.as_deref().unwrap_or("")
        )?;
        if let Some(percent_full) = self.percent_full {
            write!(f, " ({percent_full}% full)")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DisconnectNotice {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl fmt::Display for DisconnectNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}")?,
            None => f.write_str("disconnect")?,
        }
        if let Some(stream_name) = self.stream_name.as_deref() {
            write!(f, " on {stream_name}")?;
        }
        if let Some(reason) = self.reason.as_deref() {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

/// Whether to ask the server for stall warnings.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StallWarnings {
    Always,
    Never,
    /// Request them only while `warn`-level logging is enabled.
    #[default]
    WhenWarnEnabled,
}

impl StallWarnings {
    pub fn requested(self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::WhenWarnEnabled => tracing::enabled!(tracing::Level::WARN),
        }
    }
}

/// Filter criteria sent as the URL-encoded request body.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterParams {
    params: BTreeMap<String, String>,
}

impl FilterParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on track terms, joined with commas.
    pub fn track<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = terms
            .into_iter()
            .map(|term| term.as_ref().trim().to_string())
            .filter(|term| !term.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        Self::new().with_param("track", joined)
    }

    /// Sets a raw filter parameter, replacing any previous value.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Merges every entry of `other`, which wins on conflicts.
    pub fn merge(mut self, other: FilterParams) -> Self {
        self.params.extend(other.params);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters in key order, as sent on the wire and signed.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for FilterParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            params: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Encodes pairs as an `application/x-www-form-urlencoded` body.
pub fn encode_form(pairs: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{encode_form, ControlMarker, FilterParams, Message, StallWarnings};

    #[test]
    fn track_joins_terms_with_commas() {
        let filter = FilterParams::track(["rust", " tokio ", ""]);
        assert_eq!(filter.get("track"), Some("rust,tokio"));
    }

    #[test]
    fn raw_params_merge_over_track() {
        let filter = FilterParams::track(["a"])
            .merge(FilterParams::from_iter([("track", "b"), ("language", "en")]));
        assert_eq!(
            filter.to_pairs(),
            vec![
                ("language".to_string(), "en".to_string()),
                ("track".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn form_body_escapes_reserved_characters() {
        let filter = FilterParams::track(["#rust", "a b"]).with_param("stall_warnings", "true");
        assert_eq!(
            encode_form(&filter.to_pairs()),
            "stall_warnings=true&track=%23rust%2Ca+b"
        );
    }

    #[test]
    fn explicit_stall_warning_policies() {
        assert!(StallWarnings::Always.requested());
        assert!(!StallWarnings::Never.requested());
    }

    #[test]
    fn plain_message_has_no_control_marker() {
        let message = Message::from_text(r#"{"id":1,"text":"hi"}"#).expect("parse");
        assert_eq!(message.get("id"), Some(&json!(1)));
        assert!(message.control().is_none());
    }

    #[test]
    fn warning_marker_is_typed() {
        let message = Message::new(json!({
            "warning": {"code": "FALLING_BEHIND", "message": "slow", "percent_full": 60}
        }));
        match message.control() {
            Some(ControlMarker::Warning(warning)) => {
                assert_eq!(warning.code.as_deref(), Some("FALLING_BEHIND"));
                assert_eq!(warning.percent_full, Some(60));
                assert_eq!(warning.to_string(), "FALLING_BEHIND: slow (60% full)");
            }
            other => panic!("unexpected marker: {other:?}"),
        }
    }

    #[test]
    fn disconnect_marker_tolerates_unexpected_shape() {
        let message = Message::new(json!({"disconnect": "shutting down"}));
        match message.control() {
            Some(ControlMarker::Disconnect(notice)) => {
                assert_eq!(notice.reason.as_deref(), Some("\"shutting down\""));
                assert!(notice.code.is_none());
            }
            other => panic!("unexpected marker: {other:?}"),
        }
    }

    #[test]
    fn disconnect_marker_display() {
        let message = Message::new(json!({
            "disconnect": {"code": 4, "stream_name": "main", "reason": "duplicate stream"}
        }));
        let Some(ControlMarker::Disconnect(notice)) = message.control() else {
            panic!("expected disconnect marker");
        };
        assert_eq!(notice.to_string(), "code 4 on main: duplicate stream");
    }
}
