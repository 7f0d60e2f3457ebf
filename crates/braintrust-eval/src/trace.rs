//! Span plumbing for eval runs.
//!
//! The engine talks to a small [`Tracer`] seam so runs can be exported
//! through OpenTelemetry ([`OtelTracer`]) or captured in memory for tests
//! ([`crate::testing::RecordingTracer`]).

use std::fmt;
use std::sync::Arc;

use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{Status, TraceContextExt, Tracer as _};
use opentelemetry::{global, Array, Context, KeyValue, StringValue, Value};
use serde::Serialize;

/// Attribute keys written on eval, task and score spans.
pub mod attr {
	pub const PARENT: &str = "braintrust.parent";
	pub const SPAN_ATTRIBUTES: &str = "braintrust.span_attributes";
	pub const INPUT_JSON: &str = "braintrust.input_json";
	pub const OUTPUT_JSON: &str = "braintrust.output_json";
	pub const OUTPUT: &str = "braintrust.output";
	pub const EXPECTED: &str = "braintrust.expected";
	pub const METADATA: &str = "braintrust.metadata";
	pub const SCORES: &str = "braintrust.scores";
	pub const ORIGIN: &str = "braintrust.origin";
	pub const TAGS: &str = "braintrust.tags";

	pub const EXCEPTION_EVENT: &str = "exception";
	pub const EXCEPTION_TYPE: &str = "exception.type";
	pub const EXCEPTION_MESSAGE: &str = "exception.message";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
	String(String),
	StringArray(Vec<String>),
}

impl AttrValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(s) => Some(s),
			Self::StringArray(_) => None,
		}
	}
}

impl From<String> for AttrValue {
	fn from(value: String) -> Self {
		Self::String(value)
	}
}

impl From<&str> for AttrValue {
	fn from(value: &str) -> Self {
		Self::String(value.to_string())
	}
}

impl From<Vec<String>> for AttrValue {
	fn from(value: Vec<String>) -> Self {
		Self::StringArray(value)
	}
}

/// One live span. Implemented by each tracing backend.
pub trait SpanBackend: Send + Sync {
	fn set_attribute(&self, key: &str, value: AttrValue);
	fn add_event(&self, name: &str, attributes: Vec<(String, AttrValue)>);
	fn set_error(&self, message: &str);
	fn start_child(&self, name: &str) -> SpanHandle;
	fn end(&self);
}

pub trait Tracer: Send + Sync {
	/// Start a root span.
	fn start_span(&self, name: &str) -> SpanHandle;
}

/// Cheaply cloneable reference to a live span.
///
/// Tasks receive handles to their own span and to the enclosing eval span and
/// may annotate either. Ending and error status stay with the engine.
#[derive(Clone)]
pub struct SpanHandle {
	inner: Arc<dyn SpanBackend>,
}

impl SpanHandle {
	pub fn new(backend: impl SpanBackend + 'static) -> Self {
		Self { inner: Arc::new(backend) }
	}

	pub fn set_attribute(&self, key: &str, value: impl Into<AttrValue>) {
		self.inner.set_attribute(key, value.into());
	}

	/// Serialize `value` and store it as a JSON string attribute.
	pub fn set_json_attribute<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), serde_json::Error> {
		let encoded = serde_json::to_string(value)?;
		self.inner.set_attribute(key, AttrValue::String(encoded));
		Ok(())
	}

	pub fn add_event(&self, name: &str, attributes: Vec<(String, AttrValue)>) {
		self.inner.add_event(name, attributes);
	}

	pub(crate) fn child(&self, name: &str) -> SpanHandle {
		self.inner.start_child(name)
	}

	pub(crate) fn set_error(&self, message: &str) {
		self.inner.set_error(message);
	}

	/// Record an `exception` event and mark the span as errored.
	pub(crate) fn record_error(&self, label: &str, message: &str) {
		self.inner.add_event(
			attr::EXCEPTION_EVENT,
			vec![
				(attr::EXCEPTION_TYPE.to_string(), AttrValue::from(label)),
				(attr::EXCEPTION_MESSAGE.to_string(), AttrValue::from(message)),
			],
		);
		self.inner.set_error(message);
	}

	pub(crate) fn end(&self) {
		self.inner.end();
	}
}

impl fmt::Debug for SpanHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SpanHandle").finish_non_exhaustive()
	}
}

/// Exports spans through the OpenTelemetry API.
///
/// Whatever provider is installed globally (or handed in) decides where the
/// spans go.
#[derive(Clone)]
pub struct OtelTracer {
	tracer: Arc<BoxedTracer>,
}

impl OtelTracer {
	pub fn new(tracer: BoxedTracer) -> Self {
		Self { tracer: Arc::new(tracer) }
	}

	/// Use the globally registered tracer provider.
	pub fn global() -> Self {
		Self::new(global::tracer("braintrust.eval"))
	}

	fn start_in(&self, name: &str, parent: &Context) -> SpanHandle {
		let span = self.tracer.start_with_context(name.to_string(), parent);
		SpanHandle::new(OtelSpan { tracer: self.clone(), cx: parent.with_span(span) })
	}
}

impl Tracer for OtelTracer {
	fn start_span(&self, name: &str) -> SpanHandle {
		self.start_in(name, &Context::current())
	}
}

struct OtelSpan {
	tracer: OtelTracer,
	cx: Context,
}

impl SpanBackend for OtelSpan {
	fn set_attribute(&self, key: &str, value: AttrValue) {
		self.cx.span().set_attribute(KeyValue::new(key.to_string(), otel_value(value)));
	}

	fn add_event(&self, name: &str, attributes: Vec<(String, AttrValue)>) {
		let attributes = attributes.into_iter().map(|(k, v)| KeyValue::new(k, otel_value(v))).collect();
		self.cx.span().add_event(name.to_string(), attributes);
	}

	fn set_error(&self, message: &str) {
		self.cx.span().set_status(Status::error(message.to_string()));
	}

	fn start_child(&self, name: &str) -> SpanHandle {
		self.tracer.start_in(name, &self.cx)
	}

	fn end(&self) {
		self.cx.span().end();
	}
}

fn otel_value(value: AttrValue) -> Value {
	match value {
		AttrValue::String(s) => Value::from(s),
		AttrValue::StringArray(items) => {
			Value::Array(Array::String(items.into_iter().map(StringValue::from).collect()))
		}
	}
}
