//! HTTP client operations

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use rhai::{Dynamic, Engine, Map};
use tracing::debug;

use super::{HostBridge, options_map};
use crate::error::RunError;
use crate::value::{Fields, FromScript, ScriptValue, string_entries};

/// Redirects followed when `allow_redirect` is set
const MAX_REDIRECTS: usize = 10;

/// Shorthand body encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyType {
    Json,
    Text,
    Binary,
}

impl BodyType {
    fn parse(context: &str, field: &str, value: &str) -> Result<Self, RunError> {
        match value {
            "json" => Ok(BodyType::Json),
            "text" => Ok(BodyType::Text),
            "bin" => Ok(BodyType::Binary),
            other => Err(RunError::Configuration(format!(
                "{context}.{field}: expected \"json\", \"text\" or \"bin\", found {other:?}"
            ))),
        }
    }

    fn mime(self) -> &'static str {
        match self {
            BodyType::Json => "application/json",
            BodyType::Text => "text/plain; charset=utf-8",
            BodyType::Binary => "application/octet-stream",
        }
    }
}

/// Request options read from the script
#[derive(Debug, Clone)]
struct HttpOptions {
    ignore_https_checks: bool,
    allow_redirect: bool,
    timeout: Option<Duration>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    content_type: Option<BodyType>,
    accept: Option<BodyType>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            ignore_https_checks: true,
            allow_redirect: true,
            timeout: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            content_type: None,
            accept: None,
        }
    }
}

impl FromScript for HttpOptions {
    fn from_script(context: &str, map: &Map) -> Result<Self, RunError> {
        let fields = Fields::new(context, map);
        let defaults = HttpOptions::default();

        let mut headers = Vec::new();
        if let Some(header) = fields.map("header")? {
            let header_context = format!("{context}.header");
            let values = Fields::new(&header_context, &header);
            for name in header.keys() {
                for value in values.strings(name)? {
                    headers.push((name.to_string(), value));
                }
            }
        }

        let cookies = match fields.map("cookies")? {
            Some(map) => string_entries(context, "cookies", &map)?,
            None => Vec::new(),
        };

        let body_type = |field: &str| -> Result<Option<BodyType>, RunError> {
            fields
                .string(field)?
                .map(|v| BodyType::parse(context, field, &v))
                .transpose()
        };

        Ok(HttpOptions {
            ignore_https_checks: fields
                .bool("ignore_https_checks")?
                .unwrap_or(defaults.ignore_https_checks),
            allow_redirect: fields
                .bool("allow_redirect")?
                .unwrap_or(defaults.allow_redirect),
            timeout: fields.seconds("timeout")?,
            headers,
            cookies,
            content_type: body_type("content_type")?,
            accept: body_type("accept")?,
        })
    }
}

impl HttpOptions {
    fn client(&self) -> Result<Client, RunError> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(self.ignore_https_checks)
            .redirect(if self.allow_redirect {
                Policy::limited(MAX_REDIRECTS)
            } else {
                Policy::none()
            });
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.build()?)
    }

    fn header_map(&self) -> Result<HeaderMap, RunError> {
        let invalid = |name: &str, e: &dyn std::fmt::Display| {
            RunError::Configuration(format!("header {name}: {e}"))
        };

        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, &e))?;
            let value = HeaderValue::from_str(value).map_err(|e| invalid(name, &e))?;
            map.append(header, value);
        }
        if let Some(accept) = self.accept {
            map.insert(ACCEPT, HeaderValue::from_static(accept.mime()));
        }
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            let value = HeaderValue::from_str(&cookie).map_err(|e| invalid("cookie", &e))?;
            map.insert(COOKIE, value);
        }
        Ok(map)
    }
}

/// Encode a script body, returning the bytes and their default content type
fn encode_body(
    body: &ScriptValue,
    content_type: Option<BodyType>,
) -> Result<Option<(Vec<u8>, BodyType)>, RunError> {
    let encoded = match (body, content_type) {
        (ScriptValue::Unit, _) => return Ok(None),
        (
            ScriptValue::Struct(_) | ScriptValue::Array(_),
            Some(kind @ (BodyType::Text | BodyType::Binary)),
        ) => {
            return Err(RunError::Type(format!(
                "body: a map or array is sent as JSON, not {}",
                kind.mime()
            )));
        }
        (ScriptValue::Struct(_) | ScriptValue::Array(_), _) | (_, Some(BodyType::Json)) => {
            let json = serde_json::to_vec(&body.to_json())
                .map_err(|e| RunError::Type(format!("body is not JSON serializable: {e}")))?;
            (json, BodyType::Json)
        }
        (ScriptValue::Bytes(bytes), _) => (bytes.clone(), BodyType::Binary),
        (ScriptValue::Text(text), _) => (text.clone().into_bytes(), BodyType::Text),
        (ScriptValue::Int(i), _) => (i.to_string().into_bytes(), BodyType::Text),
        (ScriptValue::Float(f), _) => (f.to_string().into_bytes(), BodyType::Text),
        (ScriptValue::Bool(b), _) => (b.to_string().into_bytes(), BodyType::Text),
    };
    Ok(Some(encoded))
}

/// Parsed JSON when possible, else text when UTF-8, else the raw bytes
fn decode_body(bytes: &[u8]) -> ScriptValue {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(bytes) {
        return ScriptValue::from_json(json);
    }
    ScriptValue::from_bytes(bytes.to_vec())
}

async fn into_script_response(response: reqwest::Response) -> Result<ScriptValue, RunError> {
    let status = i64::from(response.status().as_u16());

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in response.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let header = headers
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                ScriptValue::Text(values.remove(0))
            } else {
                values.into()
            };
            (name, value)
        })
        .collect();

    let cookies = response
        .cookies()
        .map(|c| (c.name().to_string(), ScriptValue::Text(c.value().to_string())))
        .collect();

    let bytes = response.bytes().await?.to_vec();
    let body = decode_body(&bytes);

    Ok(ScriptValue::Struct(BTreeMap::from([
        ("status".to_string(), ScriptValue::Int(status)),
        ("header".to_string(), ScriptValue::Struct(header)),
        ("cookies".to_string(), ScriptValue::Struct(cookies)),
        ("raw_body".to_string(), ScriptValue::Bytes(bytes)),
        ("body".to_string(), body),
    ])))
}

impl HostBridge {
    fn http(
        &self,
        op: &str,
        method: Method,
        url: &str,
        body: &Dynamic,
        opts: &Dynamic,
    ) -> Result<Dynamic, RunError> {
        let options = HttpOptions::from_script(op, &options_map(op, opts)?)?;
        let body = encode_body(&ScriptValue::from_dynamic(body)?, options.content_type)?;
        let client = options.client()?;
        let mut headers = options.header_map()?;

        let mut request = client.request(method.clone(), url);
        if let Some((bytes, default_type)) = body {
            if !headers.contains_key(CONTENT_TYPE) {
                let mime = options.content_type.unwrap_or(default_type).mime();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(mime));
            }
            request = request.body(bytes);
        }
        let request = request.headers(headers);

        debug!(method = %method, url = %url, "http request");
        let response = self.block_on(async {
            let response = request.send().await?;
            into_script_response(response).await
        })?;
        Ok(response.into_dynamic())
    }

    fn http_post_form(
        &self,
        url: &str,
        fields: &Map,
        files: &Dynamic,
        opts: &Dynamic,
    ) -> Result<Dynamic, RunError> {
        let op = "http_post_form";
        let options = HttpOptions::from_script(op, &options_map(op, opts)?)?;
        let files = options_map(op, files)?;

        let mut form = Form::new();
        for (name, value) in string_entries(op, "fields", fields)? {
            form = form.text(name, value);
        }
        for (name, path) in string_entries(op, "files", &files)? {
            let path = self.resolve_path(&path);
            let bytes = std::fs::read(&path)
                .map_err(|e| RunError::NotFound(format!("{}: {e}", path.display())))?;
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            form = form.part(name, Part::bytes(bytes).file_name(file_name));
        }

        let request = options
            .client()?
            .post(url)
            .headers(options.header_map()?)
            .multipart(form);

        debug!(url = %url, "http form post");
        let response = self.block_on(async {
            let response = request.send().await?;
            into_script_response(response).await
        })?;
        Ok(response.into_dynamic())
    }
}

macro_rules! register_bodyless {
    ($engine:expr, $bridge:expr, $name:literal, $method:expr) => {{
        let b = Arc::clone($bridge);
        $engine.register_fn($name, move |url: &str| {
            b.invoke($name, || {
                b.http($name, $method, url, &Dynamic::UNIT, &Dynamic::UNIT)
            })
        });
        let b = Arc::clone($bridge);
        $engine.register_fn($name, move |url: &str, opts: Dynamic| {
            b.invoke($name, || b.http($name, $method, url, &Dynamic::UNIT, &opts))
        });
    }};
}

macro_rules! register_with_body {
    ($engine:expr, $bridge:expr, $name:literal, $method:expr) => {{
        let b = Arc::clone($bridge);
        $engine.register_fn($name, move |url: &str, body: Dynamic| {
            b.invoke($name, || b.http($name, $method, url, &body, &Dynamic::UNIT))
        });
        let b = Arc::clone($bridge);
        $engine.register_fn($name, move |url: &str, body: Dynamic, opts: Dynamic| {
            b.invoke($name, || b.http($name, $method, url, &body, &opts))
        });
    }};
}

pub(super) fn register(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    register_bodyless!(engine, bridge, "http_get", Method::GET);
    register_bodyless!(engine, bridge, "http_head", Method::HEAD);
    register_bodyless!(engine, bridge, "http_options", Method::OPTIONS);
    register_with_body!(engine, bridge, "http_post", Method::POST);
    register_with_body!(engine, bridge, "http_put", Method::PUT);
    register_with_body!(engine, bridge, "http_patch", Method::PATCH);
    register_with_body!(engine, bridge, "http_delete", Method::DELETE);

    let b = Arc::clone(bridge);
    engine.register_fn("http_post_form", move |url: &str, fields: Map| {
        b.invoke("http_post_form", || {
            b.http_post_form(url, &fields, &Dynamic::UNIT, &Dynamic::UNIT)
        })
    });
    let b = Arc::clone(bridge);
    engine.register_fn(
        "http_post_form",
        move |url: &str, fields: Map, files: Dynamic| {
            b.invoke("http_post_form", || {
                b.http_post_form(url, &fields, &files, &Dynamic::UNIT)
            })
        },
    );
    let b = Arc::clone(bridge);
    engine.register_fn(
        "http_post_form",
        move |url: &str, fields: Map, files: Dynamic, opts: Dynamic| {
            b.invoke("http_post_form", || {
                b.http_post_form(url, &fields, &files, &opts)
            })
        },
    );
}
