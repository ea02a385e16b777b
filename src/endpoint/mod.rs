//! Declarative endpoints: route template + method + response handler.
//!
//! An endpoint call takes positional arguments, bound to the route's
//! placeholders, and keyword arguments. Keywords named in
//! [`TRANSPORT_KEYS`] configure the HTTP request; every other keyword
//! becomes a query parameter and is handed to the handler as well.

mod registry;
mod template;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{ApiError, Result};
use crate::http::{Method, Payload, RequestBody, RequestExecutor, TransportOptions};

pub use registry::EndpointRegistry;
pub use template::RouteTemplate;

/// Keyword arguments routed to the transport instead of the query string.
pub const TRANSPORT_KEYS: [&str; 6] = [
    "params",
    "json",
    "body",
    "headers",
    "cookies",
    "allow_redirects",
];

/// Shorthand for a JSON body on POST, PUT and PATCH.
pub const JSON_DATA_KEY: &str = "json_data";

/// Arguments of one endpoint invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Call {
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Call {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Keyword arguments split into transport options and the remaining extras.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Partitioned {
    pub options: TransportOptions,
    /// Non-transport keywords, also present in `options.query`.
    pub extra: BTreeMap<String, Value>,
}

/// Splits keyword arguments per the rules in the module docs.
pub fn partition_kwargs(method: Method, kwargs: &BTreeMap<String, Value>) -> Result<Partitioned> {
    let mut options = TransportOptions::default();
    let mut extra = BTreeMap::new();

    if let Some(params) = kwargs.get("params") {
        let params = params
            .as_object()
            .ok_or_else(|| ApiError::InvalidRequest("`params` must be an object".into()))?;
        for (key, value) in params {
            push_query(&mut options.query, key, value);
        }
    }
    if let Some(json) = kwargs.get("json") {
        options.json = Some(json.clone());
    }
    if let Some(body) = kwargs.get("body") {
        options.body = Some(match body {
            Value::String(text) => RequestBody::Raw(text.clone()),
            Value::Object(fields) => RequestBody::Form(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), scalar_to_string(value)))
                    .collect(),
            ),
            _ => {
                return Err(ApiError::InvalidRequest(
                    "`body` must be a string or an object".into(),
                ));
            }
        });
    }
    if let Some(headers) = kwargs.get("headers") {
        options.headers = string_map("headers", headers)?;
    }
    if let Some(cookies) = kwargs.get("cookies") {
        options.cookies = string_map("cookies", cookies)?;
    }
    if let Some(allow_redirects) = kwargs.get("allow_redirects") {
        options.allow_redirects = allow_redirects.as_bool().ok_or_else(|| {
            ApiError::InvalidRequest("`allow_redirects` must be a boolean".into())
        })?;
    }

    for (key, value) in kwargs {
        if TRANSPORT_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == JSON_DATA_KEY
            && method.is_mutating()
            && options.json.is_none()
            && options.body.is_none()
        {
            options.json = Some(value.clone());
            continue;
        }
        push_query(&mut options.query, key, value);
        extra.insert(key.clone(), value.clone());
    }

    Ok(Partitioned { options, extra })
}

/// Strings verbatim, arrays repeat the key, nulls are dropped.
fn push_query(query: &mut Vec<(String, String)>, key: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                push_query(query, key, item);
            }
        }
        other => query.push((key.to_string(), scalar_to_string(other))),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn string_map(field: &str, value: &Value) -> Result<BTreeMap<String, String>> {
    let object = value
        .as_object()
        .ok_or_else(|| ApiError::InvalidRequest(format!("`{field}` must be an object")))?;
    Ok(object
        .iter()
        .map(|(key, value)| (key.clone(), scalar_to_string(value)))
        .collect())
}

/// What a handler sees: the raw response plus the original call arguments.
#[derive(Debug, Clone, Copy)]
pub struct HandlerInput<'a> {
    pub payload: &'a Payload,
    pub status: StatusCode,
    pub args: &'a [String],
    pub kwargs: &'a BTreeMap<String, Value>,
}

impl HandlerInput<'_> {
    /// The payload as JSON, with text bodies wrapped in a JSON string.
    pub fn json(&self) -> Value {
        self.payload.clone().into_json()
    }
}

pub type Handler<T> = Arc<dyn Fn(HandlerInput<'_>) -> Result<T> + Send + Sync>;

/// A declared remote operation. Immutable once built.
pub struct EndpointSpec<T = Value> {
    name: String,
    template: RouteTemplate,
    method: Method,
    handler: Handler<T>,
    allow_unresolved: bool,
}

impl<T> EndpointSpec<T> {
    pub fn new<F>(name: impl Into<String>, template: &str, method: Method, handler: F) -> Self
    where
        F: Fn(HandlerInput<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            template: RouteTemplate::parse(template),
            method,
            handler: Arc::new(handler),
            allow_unresolved: false,
        }
    }

    pub fn get<F>(name: impl Into<String>, template: &str, handler: F) -> Self
    where
        F: Fn(HandlerInput<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::new(name, template, Method::Get, handler)
    }

    pub fn post<F>(name: impl Into<String>, template: &str, handler: F) -> Self
    where
        F: Fn(HandlerInput<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::new(name, template, Method::Post, handler)
    }

    /// Leave placeholders without a matching argument as literal text
    /// instead of failing with a configuration error.
    pub fn allow_unresolved(mut self, allow: bool) -> Self {
        self.allow_unresolved = allow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn template(&self) -> &RouteTemplate {
        &self.template
    }

    /// Resolves the route and partitions keywords without sending anything.
    pub fn prepare(&self, call: &Call) -> Result<(String, Partitioned)> {
        let route = self.template.format(&call.args, self.allow_unresolved)?;
        let partitioned = partition_kwargs(self.method, &call.kwargs)?;
        Ok((route, partitioned))
    }

    /// Sends the call through `executor` and hands the outcome to the handler.
    #[tracing::instrument(skip_all, fields(endpoint = %self.name))]
    pub async fn invoke(
        &self,
        executor: &RequestExecutor,
        config: &ClientConfig,
        call: &Call,
        cancel: Option<&CancellationToken>,
    ) -> Result<T> {
        let (route, partitioned) = self.prepare(call)?;
        debug!("Invoking {} {} {}", self.name, self.method, route);

        let outcome = executor
            .execute(config, self.method, &route, &[], &partitioned.options, cancel)
            .await?;

        (self.handler)(HandlerInput {
            payload: &outcome.payload,
            status: outcome.status,
            args: &call.args,
            kwargs: &partitioned.extra,
        })
    }
}

impl<T> Clone for EndpointSpec<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            template: self.template.clone(),
            method: self.method,
            handler: Arc::clone(&self.handler),
            allow_unresolved: self.allow_unresolved,
        }
    }
}

impl<T> fmt::Debug for EndpointSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSpec")
            .field("name", &self.name)
            .field("template", &self.template.as_str())
            .field("method", &self.method)
            .field("allow_unresolved", &self.allow_unresolved)
            .finish_non_exhaustive()
    }
}

/// Handler that returns the JSON payload on 200 and a domain error otherwise.
///
/// The error names `what` followed by the call's positional arguments,
/// e.g. "Failed to fetch author 42".
pub fn expect_ok(
    what: impl Into<String>,
) -> impl Fn(HandlerInput<'_>) -> Result<Value> + Send + Sync + 'static {
    let what = what.into();
    move |input: HandlerInput<'_>| {
        if input.status != StatusCode::OK {
            let subject = if input.args.is_empty() {
                what.clone()
            } else {
                format!("{} {}", what, input.args.join(" "))
            };
            return Err(ApiError::domain(
                input.status.as_u16(),
                format!("Failed to fetch {}", subject),
            ));
        }
        Ok(input.json())
    }
}
