use std::{
    any::{Any, type_name},
    backtrace::{Backtrace, BacktraceStatus},
    error::Error as StdError,
    fmt,
};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::lane::Lane;

/// Error details carried by ERROR-lane envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorInfo {
    /// Kind of the failure, usually the Rust type name of the error.
    #[serde(rename = "error")]
    pub kind: String,
    #[serde(rename = "msg")]
    pub message: String,
    pub stacktrace: String,
}

/// Who produced an envelope.
///
/// Computed once per process and stamped by the bus client on every publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Provenance {
    pub plugin_name: String,
    pub plugin_version: String,
    pub host: String,
}

impl Provenance {
    pub fn new(
        plugin_name: impl Into<String>,
        plugin_version: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            plugin_version: plugin_version.into(),
            host: host.into(),
        }
    }

    /// Provenance for a plugin running on this machine.
    pub fn local(plugin_name: impl Into<String>, plugin_version: impl Into<String>) -> Self {
        Self::new(plugin_name, plugin_version, local_host_name())
    }
}

/// Host name of this machine, or `unknown` when it cannot be determined.
pub fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The unit of exchange on every topic.
///
/// Producer provenance is filled in by the bus client when the envelope is
/// published. `consumed_at` is the only field a consumer sets, and it is set
/// at most once per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(bound(deserialize = "I: Deserialize<'de>, P: Deserialize<'de>"))]
pub struct Envelope<I, P> {
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    consumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    input: Option<I>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    payload: Option<P>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<ErrorInfo>,
}

/// A field that is on the wire is populated, even when its value is `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl<I, P> Envelope<I, P> {
    fn blank(input: Option<I>, payload: Option<P>, err: Option<ErrorInfo>) -> Self {
        Self {
            created_at: Utc::now(),
            consumed_at: None,
            plugin_name: None,
            plugin_version: None,
            host: None,
            input,
            payload,
            err,
        }
    }

    /// An origin message with no upstream input.
    pub fn new(payload: P) -> Self {
        Self::blank(None, Some(payload), None)
    }

    /// A message derived from an upstream envelope or value.
    pub fn derived(input: I, payload: P) -> Self {
        Self::blank(Some(input), Some(payload), None)
    }

    /// An error record. It never carries a payload.
    pub fn failed(input: Option<I>, err: ErrorInfo) -> Self {
        Self::blank(input, None, Some(err))
    }

    pub(crate) fn stamped(mut self, provenance: &Provenance) -> Self {
        self.plugin_name = Some(provenance.plugin_name.clone());
        self.plugin_version = Some(provenance.plugin_version.clone());
        self.host = Some(provenance.host.clone());
        self
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn consumed_at(&self) -> Option<DateTime<Utc>> {
        self.consumed_at
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin_name.as_deref()
    }

    pub fn plugin_version(&self) -> Option<&str> {
        self.plugin_version.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn input(&self) -> Option<&I> {
        self.input.as_ref()
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.err.as_ref()
    }

    pub fn into_payload(self) -> Option<P> {
        self.payload
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }

    /// Stamps `consumed_at` with the current time.
    ///
    /// Returns `false` and leaves the envelope untouched if it was already
    /// stamped.
    pub fn mark_consumed(&mut self) -> bool {
        self.mark_consumed_at(Utc::now())
    }

    pub fn mark_consumed_at(&mut self, at: DateTime<Utc>) -> bool {
        if self.consumed_at.is_some() {
            return false;
        }
        self.consumed_at = Some(at);
        true
    }

    /// Whether this envelope respects the payload/error split of `lane`.
    pub fn fits_lane(&self, lane: Lane) -> bool {
        if lane.is_error() {
            self.err.is_some() && self.payload.is_none()
        } else {
            self.err.is_none()
        }
    }
}

impl<P> Envelope<Value, P> {
    /// Payload produced by `plugin` somewhere up the input chain.
    ///
    /// Walks `input`, `input.input`, ... until an envelope stamped with
    /// `plugin_name == plugin` is found, so callers do not depend on how many
    /// stages sit between them and the producer.
    pub fn upstream_payload(&self, plugin: &str) -> Option<&Value> {
        let mut cursor = self.input.as_ref();
        while let Some(node) = cursor {
            if node.get("plugin_name").and_then(Value::as_str) == Some(plugin) {
                return node.get("payload");
            }
            cursor = node.get("input");
        }
        None
    }
}

/// A failed unit of work, as reported by a subscription callback.
///
/// Any `std::error::Error` converts into a `Failure` with `?`, keeping the
/// error's type name as the failure kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: String,
    message: String,
    stacktrace: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        let stacktrace = render_trace(&kind, &message, &[]);
        Self { kind, message, stacktrace }
    }

    pub fn from_error<E: StdError + ?Sized>(kind: impl Into<String>, err: &E) -> Self {
        let kind = kind.into();
        let message = err.to_string();
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        let stacktrace = render_trace(&kind, &message, &causes);
        Self { kind, message, stacktrace }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let inner: &(dyn StdError + 'static) = err.as_ref();
        Self::from_error(type_name::<anyhow::Error>(), inner)
    }

    /// Converts a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "callback panicked".to_string()
        };
        Self::new("panic", message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stacktrace(&self) -> &str {
        &self.stacktrace
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind.clone(),
            message: self.message.clone(),
            stacktrace: self.stacktrace.clone(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::from_error(type_name::<E>(), &err)
    }
}

fn render_trace(kind: &str, message: &str, causes: &[String]) -> String {
    let mut trace = format!("{kind}: {message}");
    for cause in causes {
        trace.push_str("\ncaused by: ");
        trace.push_str(cause);
    }
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        trace.push('\n');
        trace.push_str(&backtrace.to_string());
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stamped_origin() -> Envelope<Value, Value> {
        Envelope::new(json!({"coordinate": "g:a:1.0"}))
            .stamped(&Provenance::new("eu.f4sten.pomanalyzer.Main", "0.2.0", "worker-1"))
    }

    #[test]
    fn round_trip_keeps_populated_fields() {
        let original = stamped_origin();
        let wire = serde_json::to_string(&original).unwrap();
        let decoded: Envelope<Value, Value> = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn null_input_and_payload_survive_the_wire() {
        let original: Envelope<Value, Value> = Envelope::derived(Value::Null, Value::Null);
        let wire = serde_json::to_string(&original).unwrap();
        assert!(wire.contains(r#""input":null"#), "{wire}");
        let decoded: Envelope<Value, Value> = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded.input(), Some(&Value::Null));
        assert_eq!(decoded.payload(), Some(&Value::Null));
        assert_eq!(decoded, original);
    }

    #[test]
    fn absent_fields_stay_absent() {
        let original: Envelope<Value, Value> = Envelope::new(json!(1));
        let wire = serde_json::to_value(&original).unwrap();
        let object = wire.as_object().unwrap();
        for absent in ["consumed_at", "plugin_name", "plugin_version", "host", "input", "err"] {
            assert!(!object.contains_key(absent), "{absent} should not be serialized");
        }
        let decoded: Envelope<Value, Value> = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.input(), None);
        assert_eq!(decoded.error(), None);
        assert_eq!(decoded.consumed_at(), None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let wire = serde_json::to_value(stamped_origin()).unwrap();
        let mut extended = wire.clone();
        extended["schema_version"] = json!(7);
        extended["trace"] = json!({"span": "abc"});

        let plain: Envelope<Value, Value> = serde_json::from_value(wire).unwrap();
        let with_extra: Envelope<Value, Value> = serde_json::from_value(extended).unwrap();
        assert_eq!(plain, with_extra);
    }

    #[test]
    fn error_fields_use_wire_names() {
        let failure = Failure::new("java.lang.NullPointerException", "boom");
        let envelope: Envelope<Value, Value> = Envelope::failed(None, failure.to_error_info());
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["err"]["error"], json!("java.lang.NullPointerException"));
        assert_eq!(wire["err"]["msg"], json!("boom"));
        assert!(wire["err"]["stacktrace"].as_str().unwrap().starts_with("java.lang.NullPointerException: boom"));
        assert!(wire.get("payload").is_none());
    }

    #[test]
    fn consumed_at_is_stamped_once() {
        let mut envelope = stamped_origin();
        let first = Utc::now();
        assert!(envelope.mark_consumed_at(first));
        assert!(!envelope.mark_consumed());
        assert_eq!(envelope.consumed_at(), Some(first));
    }

    #[test]
    fn lane_invariants() {
        let ok: Envelope<Value, Value> = Envelope::new(json!(1));
        let failed: Envelope<Value, Value> =
            Envelope::failed(Some(json!({})), Failure::new("k", "m").to_error_info());
        assert!(ok.fits_lane(Lane::Normal));
        assert!(ok.fits_lane(Lane::Priority));
        assert!(!ok.fits_lane(Lane::Error));
        assert!(failed.fits_lane(Lane::Error));
        assert!(!failed.fits_lane(Lane::Normal));
    }

    #[test]
    fn upstream_payload_walks_input_chain() {
        let origin = serde_json::to_value(stamped_origin()).unwrap();
        let middle: Envelope<Value, Value> = Envelope::derived(origin, json!({"deps": 3}))
            .stamped(&Provenance::new("eu.f4sten.depgraph.Main", "0.2.0", "worker-2"));
        let leaf: Envelope<Value, Value> =
            Envelope::derived(serde_json::to_value(middle).unwrap(), json!("done"));

        assert_eq!(
            leaf.upstream_payload("eu.f4sten.pomanalyzer.Main"),
            Some(&json!({"coordinate": "g:a:1.0"}))
        );
        assert_eq!(leaf.upstream_payload("eu.f4sten.depgraph.Main"), Some(&json!({"deps": 3})));
        assert_eq!(leaf.upstream_payload("eu.f4sten.unknown.Main"), None);
    }

    #[test]
    fn std_errors_convert_with_their_type_name() {
        fn parse(raw: &str) -> Result<u32, Failure> {
            Ok(raw.parse::<u32>()?)
        }
        let failure = parse("x").unwrap_err();
        assert!(failure.kind().ends_with("ParseIntError"));
        assert_eq!(failure.message(), "invalid digit found in string");
    }

    #[test]
    fn panic_payloads_become_failures() {
        let caught = std::panic::catch_unwind(|| -> u8 { panic!("exploded") }).unwrap_err();
        let failure = Failure::from_panic(caught);
        assert_eq!(failure.kind(), "panic");
        assert_eq!(failure.message(), "exploded");
    }

    #[test]
    fn anyhow_context_ends_up_in_the_stacktrace() {
        let err = anyhow::anyhow!("disk full").context("writing index");
        let failure = Failure::from_anyhow(&err);
        assert_eq!(failure.kind(), "anyhow::Error");
        assert_eq!(failure.message(), "writing index");
        assert!(failure.stacktrace().contains("caused by: disk full"));
    }
}
