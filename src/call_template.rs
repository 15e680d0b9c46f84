//! Per-call template data. Every call gets an immutable [CallContext] describing who is making it
//! and what is being called, which request payload and metadata templates are rendered against.
//!
//! Templates use Jinja syntax and may reference any context field by name, e.g.
//! `{"id": "{{ UUID }}", "worker": "{{ WorkerID }}", "n": {{ RequestNumber }}}`.

use crate::{
    errors::TemplateError,
    ids::{IdSource, OsIdSource},
};
use chrono::{DateTime, Local, SecondsFormat};
use minijinja::{
    Environment, ErrorKind, Output, State, UndefinedBehavior, Value, escape_formatter,
    value::ValueKind,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::Write,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use uuid::Uuid;

/// Identity of the RPC method a call targets
pub trait MethodInfo {
    /// Fully qualified method name, ex: `pkg.Svc.Method`
    fn fully_qualified_name(&self) -> &str;
    /// Short method name, ex: `Method`
    fn name(&self) -> &str;
    /// Name of the service the method belongs to
    fn service_name(&self) -> &str;
    /// Name of the input message type
    fn input_name(&self) -> &str;
    /// Name of the output message type
    fn output_name(&self) -> &str;
    /// Whether the client sends a stream of messages
    fn is_client_streaming(&self) -> bool;
    /// Whether the server sends a stream of messages
    fn is_server_streaming(&self) -> bool;
}

/// A resolved method, as produced by whatever loaded the service's descriptors
#[derive(Clone, Debug, PartialEq, Eq, derive_builder::Builder)]
#[builder(setter(into))]
pub struct MethodDescriptor {
    /// Fully qualified method name, ex: `pkg.Svc.Method`
    pub fully_qualified_name: String,
    /// Short method name
    pub name: String,
    /// Name of the owning service
    pub service_name: String,
    /// Input message type name
    #[builder(default)]
    pub input_name: String,
    /// Output message type name
    #[builder(default)]
    pub output_name: String,
    /// Whether the client sends a stream of messages
    #[builder(default)]
    pub client_streaming: bool,
    /// Whether the server sends a stream of messages
    #[builder(default)]
    pub server_streaming: bool,
}

impl MethodDescriptor {
    /// Build a unary method description from a call string in either `pkg.Svc/Method` or
    /// `pkg.Svc.Method` form. Returns `None` if the string names no service.
    pub fn from_call(call: &str) -> Option<Self> {
        let call = call.trim().trim_start_matches('/');
        let (service, method) = match call.rsplit_once('/') {
            Some(split) => split,
            None => call.rsplit_once('.')?,
        };
        if service.is_empty() || method.is_empty() {
            return None;
        }
        let short_service = service.rsplit('.').next().unwrap_or(service);
        Some(Self {
            fully_qualified_name: format!("{service}.{method}"),
            name: method.to_owned(),
            service_name: short_service.to_owned(),
            input_name: String::new(),
            output_name: String::new(),
            client_streaming: false,
            server_streaming: false,
        })
    }
}

impl MethodInfo for MethodDescriptor {
    fn fully_qualified_name(&self) -> &str {
        &self.fully_qualified_name
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn service_name(&self) -> &str {
        &self.service_name
    }
    fn input_name(&self) -> &str {
        &self.input_name
    }
    fn output_name(&self) -> &str {
        &self.output_name
    }
    fn is_client_streaming(&self) -> bool {
        self.client_streaming
    }
    fn is_server_streaming(&self) -> bool {
        self.server_streaming
    }
}

/// Everything a template may reference about the call being made. Created right before the call
/// is dispatched and never mutated afterward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallContext {
    /// Identity of the worker issuing the call
    #[serde(rename = "WorkerID")]
    pub worker_id: String,
    /// Per-worker monotonically increasing request number
    #[serde(rename = "RequestNumber")]
    pub request_number: i64,
    /// Fully qualified name of the called method, ex: `pkg.Svc.Method`
    #[serde(rename = "FullyQualifiedName")]
    pub fully_qualified_name: String,
    /// Random call identifier, uppercase hex grouped 8-4-4-4-12
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// Short name of the called method
    #[serde(rename = "MethodName")]
    pub method_name: String,
    /// Short name of the service the method belongs to
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    /// Request message type name
    #[serde(rename = "InputName")]
    pub input_name: String,
    /// Response message type name
    #[serde(rename = "OutputName")]
    pub output_name: String,
    /// Whether the client sends a stream of messages
    #[serde(rename = "IsClientStreaming")]
    pub is_client_streaming: bool,
    /// Whether the server sends a stream of messages
    #[serde(rename = "IsServerStreaming")]
    pub is_server_streaming: bool,
    /// Creation time, RFC3339
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    /// Creation time, seconds since the unix epoch
    #[serde(rename = "TimestampUnix")]
    pub timestamp_unix: i64,
}

/// Builds [CallContext]s and renders payload / metadata templates against them.
///
/// Rendering is lenient: a template which compiles but fails while executing (ex: it references a
/// field that doesn't exist) yields its own unrendered source instead of an error, so that one
/// broken field doesn't stop load generation. Such failures are logged at debug level and counted
/// in [CallDataGenerator::render_failures].
pub struct CallDataGenerator {
    ids: Arc<dyn IdSource>,
    env: Environment<'static>,
    render_failures: AtomicU64,
}

impl Default for CallDataGenerator {
    fn default() -> Self {
        Self::new(Arc::new(OsIdSource))
    }
}

impl CallDataGenerator {
    /// Create a generator drawing call identifiers from `ids`
    pub fn new(ids: Arc<dyn IdSource>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.set_formatter(format_value);
        Self {
            ids,
            env,
            render_failures: AtomicU64::new(0),
        }
    }

    /// Build the context for the `request_number`th call made by `worker_id`
    pub fn new_context(
        &self,
        method: &dyn MethodInfo,
        worker_id: &str,
        request_number: i64,
    ) -> CallContext {
        self.new_context_at(method, worker_id, request_number, Local::now())
    }

    /// Same as [CallDataGenerator::new_context], but stamped with the provided time
    pub fn new_context_at(
        &self,
        method: &dyn MethodInfo,
        worker_id: &str,
        request_number: i64,
        now: DateTime<Local>,
    ) -> CallContext {
        let uuid = self.ids.next_id().unwrap_or_else(|e| {
            warn!(error = %e, "Could not generate call identifier, using nil id");
            Uuid::nil()
        });
        CallContext {
            worker_id: worker_id.to_owned(),
            request_number,
            fully_qualified_name: method.fully_qualified_name().to_owned(),
            uuid: format!("{uuid:X}"),
            method_name: method.name().to_owned(),
            service_name: method.service_name().to_owned(),
            input_name: method.input_name().to_owned(),
            output_name: method.output_name().to_owned(),
            is_client_streaming: method.is_client_streaming(),
            is_server_streaming: method.is_server_streaming(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            timestamp_unix: now.timestamp(),
        }
    }

    /// Render a request payload template. Empty templates render to empty bytes.
    pub fn render_payload(
        &self,
        ctx: &CallContext,
        template: &str,
    ) -> Result<Vec<u8>, TemplateError> {
        if template.is_empty() {
            return Ok(vec![]);
        }
        self.render(ctx, template).map(String::into_bytes)
    }

    /// Render a metadata template and parse the result as a flat JSON object of strings. Empty
    /// templates render to an empty map.
    pub fn render_metadata(
        &self,
        ctx: &CallContext,
        template: &str,
    ) -> Result<HashMap<String, String>, TemplateError> {
        if template.is_empty() {
            return Ok(HashMap::new());
        }
        let rendered = self.render(ctx, template)?;
        // A rendered `null` carries no metadata
        serde_json::from_str::<Option<HashMap<String, String>>>(&rendered)
            .map(Option::unwrap_or_default)
            .map_err(|source| TemplateError::MetadataJson { source })
    }

    /// Number of renders which failed during execution and fell back to the raw template
    pub fn render_failures(&self) -> u64 {
        self.render_failures.load(Ordering::Relaxed)
    }

    fn render(&self, ctx: &CallContext, template: &str) -> Result<String, TemplateError> {
        match self.env.render_str(template, ctx) {
            Ok(rendered) => Ok(rendered),
            Err(e) if matches!(e.kind(), ErrorKind::SyntaxError | ErrorKind::BadEscape) => {
                Err(TemplateError::Syntax { source: e })
            }
            Err(e) => {
                self.render_failures.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, worker_id = %ctx.worker_id, request_number = ctx.request_number,
                       "Template execution failed, sending it unrendered");
                Ok(template.to_owned())
            }
        }
    }
}

/// Writes booleans as `true` / `false` so rendered payloads stay valid JSON
fn format_value(
    out: &mut Output<'_>,
    state: &State<'_, '_>,
    value: &Value,
) -> Result<(), minijinja::Error> {
    if value.kind() == ValueKind::Bool {
        let text = if value.is_true() { "true" } else { "false" };
        return out
            .write_str(text)
            .map_err(|_| minijinja::Error::from(ErrorKind::WriteFailure));
    }
    escape_formatter(out, state, value)
}
