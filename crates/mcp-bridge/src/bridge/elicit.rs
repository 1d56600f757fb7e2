//! A local web page answering `elicitation/create` for clients that cannot.
//!
//! The first request starts an HTTP listener on an ephemeral loopback port.
//! Each pending request gets a page (a form built from the requested schema,
//! or a link for `url` mode); submitting it resolves the request.

use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{OnceCell, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use url::Url;

use crate::{
    auth::Opener,
    context::RequestContext,
    error::{Error, Result},
    schema::{ElicitAction, ElicitParams, ElicitResult, ElicitSchema},
};

const ID_FIELD: &str = "elicitation_id";
const REQUIRED_FIELD: &str = "required";
const ACTION_FIELD: &str = "action";

struct Pending {
    params: ElicitParams,
    reply: oneshot::Sender<ElicitResult>,
}

type PendingMap = Arc<DashMap<String, Pending>>;

/// Removes a pending entry when the waiting call goes away.
struct PendingGuard {
    pending: PendingMap,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Serves elicitation pages. The listener stops when this is dropped.
pub struct Elicitator {
    pending: PendingMap,
    addr: OnceCell<SocketAddr>,
    opener: Opener,
    shutdown: CancellationToken,
    _teardown: DropGuard,
}

impl Default for Elicitator {
    fn default() -> Self {
        Self::new()
    }
}

impl Elicitator {
    pub fn new() -> Self {
        let shutdown = CancellationToken::new();
        Self {
            pending: Arc::new(DashMap::new()),
            addr: OnceCell::new(),
            opener: Arc::new(|url: &Url| {
                info!("Opening browser for input: {}", url);
                webbrowser::open(url.as_str())
                    .map_err(|e| Error::InternalError(format!("cannot open browser: {e}")))
            }),
            _teardown: shutdown.clone().drop_guard(),
            shutdown,
        }
    }

    /// Replace the browser launch, e.g. to drive the page from a test.
    pub fn with_opener(
        mut self,
        opener: impl Fn(&Url) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.opener = Arc::new(opener);
        self
    }

    /// The listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr.get().copied()
    }

    async fn start(&self) -> Result<SocketAddr> {
        let addr = self
            .addr
            .get_or_try_init(|| async {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
                let addr = listener.local_addr()?;
                let app = Router::new()
                    .route("/", get(page))
                    .route("/submit", post(submit))
                    .with_state(self.pending.clone());
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { shutdown.cancelled().await })
                        .await;
                });
                info!("Elicitation UI listening on http://{}", addr);
                Ok::<_, Error>(addr)
            })
            .await?;
        Ok(*addr)
    }

    /// Show `params` to the user and wait for their answer.
    pub async fn elicit(
        &self,
        ctx: &RequestContext,
        mut params: ElicitParams,
    ) -> Result<ElicitResult> {
        let addr = self.start().await?;
        let id = params
            .elicitation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        let (reply, answer) = oneshot::channel();
        self.pending.insert(id.clone(), Pending { params, reply });
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.clone(),
        };

        let mut url = Url::parse(&format!("http://{addr}/"))?;
        url.query_pairs_mut().append_pair(ID_FIELD, &id);
        (self.opener)(&url)?;
        debug!("Waiting for elicitation {}", id);

        tokio::select! {
            result = answer => {
                result.map_err(|_| Error::Cancelled(format!("elicitation {id} abandoned")))
            }
            _ = ctx.cancelled() => Err(Error::Cancelled(format!("elicitation {id} cancelled"))),
        }
    }
}

/// The pending request `id` names, or the only one when `id` is absent.
fn resolve(pending: &DashMap<String, Pending>, id: Option<&str>) -> Option<String> {
    match id.filter(|id| !id.is_empty()) {
        Some(id) => pending.contains_key(id).then(|| id.to_string()),
        None if pending.len() == 1 => pending.iter().next().map(|e| e.key().clone()),
        None => None,
    }
}

#[derive(Deserialize)]
struct PageQuery {
    elicitation_id: Option<String>,
}

async fn page(State(pending): State<PendingMap>, Query(query): Query<PageQuery>) -> Response {
    let Some(id) = resolve(&pending, query.elicitation_id.as_deref()) else {
        return (StatusCode::NOT_FOUND, "no such elicitation").into_response();
    };
    let Some(entry) = pending.get(&id) else {
        return (StatusCode::NOT_FOUND, "no such elicitation").into_response();
    };
    Html(render(&id, &entry.params)).into_response()
}

async fn submit(State(pending): State<PendingMap>, body: Bytes) -> Response {
    let fields: Vec<(String, String)> = url::form_urlencoded::parse(&body).into_owned().collect();
    let field = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let Some(id) = resolve(&pending, field(ID_FIELD)) else {
        return (StatusCode::NOT_FOUND, "no such elicitation").into_response();
    };
    let action = match field(ACTION_FIELD).unwrap_or("accept") {
        "accept" => ElicitAction::Accept,
        "decline" => ElicitAction::Decline,
        "cancel" => ElicitAction::Cancel,
        other => {
            return (StatusCode::BAD_REQUEST, format!("unknown action {other}")).into_response();
        }
    };

    let result = match action {
        ElicitAction::Decline => ElicitResult::decline(),
        ElicitAction::Cancel => ElicitResult::cancel(),
        ElicitAction::Accept => {
            let Some(entry) = pending.get(&id) else {
                return (StatusCode::NOT_FOUND, "no such elicitation").into_response();
            };
            if entry.params.is_url_mode() {
                ElicitResult {
                    action: ElicitAction::Accept,
                    content: None,
                }
            } else {
                match collect(&entry.params.requested_schema, &fields) {
                    Ok(content) => ElicitResult::accept(content),
                    Err(missing) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            format!("missing required fields: {}", missing.join(", ")),
                        )
                            .into_response();
                    }
                }
            }
        }
    };

    let Some((_, entry)) = pending.remove(&id) else {
        return (StatusCode::NOT_FOUND, "no such elicitation").into_response();
    };
    let _ = entry.reply.send(result);
    Html("<html><body><p>Response recorded. You can close this window.</p></body></html>")
        .into_response()
}

/// Map submitted fields to typed content. Missing required names come back
/// sorted.
fn collect(
    schema: &ElicitSchema,
    fields: &[(String, String)],
) -> std::result::Result<HashMap<String, Value>, Vec<String>> {
    let reserved = [ID_FIELD, REQUIRED_FIELD, ACTION_FIELD];
    let mut content = HashMap::new();
    for (name, raw) in fields {
        if reserved.contains(&name.as_str()) {
            continue;
        }
        if !schema.properties.is_empty() && !schema.properties.contains_key(name) {
            continue;
        }
        if raw.is_empty() {
            continue;
        }
        content.insert(name.clone(), coerce(schema.property_type(name), raw));
    }
    for name in schema.properties.keys() {
        if schema.property_type(name) == Some("boolean") && !content.contains_key(name) {
            content.insert(name.clone(), Value::Bool(false));
        }
    }

    let required: BTreeSet<&str> = schema
        .required
        .iter()
        .map(String::as_str)
        .chain(
            fields
                .iter()
                .filter(|(k, _)| k == REQUIRED_FIELD)
                .map(|(_, v)| v.as_str()),
        )
        .collect();
    let missing: Vec<String> = required
        .into_iter()
        .filter(|name| !content.contains_key(*name))
        .map(String::from)
        .collect();
    if missing.is_empty() {
        Ok(content)
    } else {
        Err(missing)
    }
}

fn number(raw: &str) -> Option<Value> {
    if let Ok(n) = raw.parse::<i64>() {
        return Some(Value::from(n));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn boolean(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Coerce a raw form value by its declared type, or by its shape when the
/// schema declares none.
fn coerce(declared: Option<&str>, raw: &str) -> Value {
    let text = || Value::String(raw.to_string());
    match declared {
        Some("string") => text(),
        Some("integer") | Some("number") => number(raw).unwrap_or_else(text),
        Some("boolean") => boolean(raw).map(Value::Bool).unwrap_or_else(text),
        _ => number(raw)
            .or_else(|| match raw {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            })
            .unwrap_or_else(text),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn render_field(name: &str, schema: &Value, required: bool) -> String {
    let label = schema
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(name);
    let description = schema
        .get("description")
        .and_then(Value::as_str)
        .map(|d| format!("<small>{}</small>", escape(d)))
        .unwrap_or_default();
    let required_attr = if required { " required" } else { "" };
    let name = escape(name);
    let input = match schema.get("type").and_then(Value::as_str) {
        Some("boolean") => format!(r#"<input type="checkbox" name="{name}" value="true">"#),
        Some("integer") => {
            format!(r#"<input type="number" step="1" name="{name}"{required_attr}>"#)
        }
        Some("number") => {
            format!(r#"<input type="number" step="any" name="{name}"{required_attr}>"#)
        }
        _ => match schema.get("enum").and_then(Value::as_array) {
            Some(options) => {
                let options: String = options
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|o| format!(r#"<option value="{0}">{0}</option>"#, escape(o)))
                    .collect();
                format!(r#"<select name="{name}"{required_attr}>{options}</select>"#)
            }
            None => format!(r#"<input type="text" name="{name}"{required_attr}>"#),
        },
    };
    let marker = if required {
        format!(r#"<input type="hidden" name="{REQUIRED_FIELD}" value="{name}">"#)
    } else {
        String::new()
    };
    let star = if required { " *" } else { "" };
    format!(
        "<p><label>{}{star}<br>{input}</label>{description}{marker}</p>",
        escape(label)
    )
}

fn render(id: &str, params: &ElicitParams) -> String {
    let mut body = format!("<h1>Input requested</h1><p>{}</p>", escape(&params.message));
    body.push_str(r#"<form method="post" action="/submit">"#);
    body.push_str(&format!(
        r#"<input type="hidden" name="{ID_FIELD}" value="{}">"#,
        escape(id)
    ));

    if params.is_url_mode() {
        let url = params.url.as_deref().unwrap_or_default();
        body.push_str(&format!(
            r#"<p><a href="{0}" target="_blank" rel="noopener">{0}</a></p>"#,
            escape(url)
        ));
        body.push_str(r#"<button name="action" value="accept">Continue</button>"#);
    } else {
        let schema = &params.requested_schema;
        let mut names: Vec<&String> = schema.properties.keys().collect();
        names.sort();
        for name in names {
            let required = schema.required.contains(name);
            body.push_str(&render_field(name, &schema.properties[name], required));
        }
        body.push_str(r#"<button name="action" value="accept">Submit</button>"#);
    }
    body.push_str(
        r#" <button name="action" value="decline" formnovalidate>Decline</button> <button name="action" value="cancel" formnovalidate>Cancel</button></form>"#,
    );
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Input requested</title></head><body>{body}</body></html>"
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> ElicitSchema {
        ElicitSchema::default()
            .with_property("email", json!({"type": "string"}))
            .with_property("code", json!({"type": "integer"}))
            .with_property("subscribe", json!({"type": "boolean"}))
            .with_required("email")
    }

    fn form(body: &str) -> Vec<(String, String)> {
        url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect()
    }

    #[test]
    fn test_collect_coerces() {
        let content = collect(
            &schema(),
            &form("email=user%40example.com&code=1234&subscribe=on&required=email"),
        )
        .unwrap();
        assert_eq!(content["email"], json!("user@example.com"));
        assert_eq!(content["code"], json!(1234));
        assert_eq!(content["subscribe"], json!(true));
    }

    #[test]
    fn test_missing_required_sorted() {
        let missing = collect(&schema(), &form("code=1&required=zeta&required=alpha")).unwrap_err();
        assert_eq!(missing, vec!["alpha", "email", "zeta"]);
    }

    #[test]
    fn test_untyped_values() {
        assert_eq!(coerce(None, "12"), json!(12));
        assert_eq!(coerce(None, "1.5"), json!(1.5));
        assert_eq!(coerce(None, "true"), json!(true));
        assert_eq!(coerce(Some("string"), "12"), json!("12"));
    }

    #[test]
    fn test_render_escapes() {
        let params = ElicitParams::new("<b>hi</b>", schema());
        let page = render("e1", &params);
        assert!(page.contains("&lt;b&gt;hi&lt;/b&gt;"));
        assert!(page.contains(r#"name="required" value="email""#));
        assert!(page.contains(r#"name="elicitation_id" value="e1""#));
    }
}
