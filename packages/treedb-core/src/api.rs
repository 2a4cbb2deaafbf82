//! Transport-neutral request router.
//!
//! An HTTP server parses the method, target and JSON body, hands them to
//! [`route`], and writes back the returned status and body. All error
//! statuses come from [`status_code`].

use std::path::{Path, PathBuf};
use std::str::FromStr;

use percent_encoding::percent_decode_str;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{flag_value, Config};
use crate::coordinator::{status_code, AccessCoordinator};
use crate::error::{Error, Result};
use crate::hierarchy::Placement;
use crate::ids::{NodeId, SessionId};
use crate::node::{FieldValue, Fields, Node};
use crate::traits::{Clock, StoreBackend};

pub const SESSION_HEADER: &str = "X-Session-Id";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(Error::Validation(format!("unsupported method {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Value of the `X-Session-Id` header, if sent.
    pub session_header: Option<String>,
    pub body: Value,
}

impl ApiRequest {
    /// Build a request from a target such as `/api/nodes?session=abc`.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, Vec::new()),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            session_header: None,
            body: Value::Null,
        }
    }

    pub fn with_session(mut self, id: &SessionId) -> Self {
        self.session_header = Some(id.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Session id from the `session` query parameter, else the header.
    pub fn session_id(&self) -> Option<SessionId> {
        self.query_param("session")
            .or(self.session_header.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(SessionId::from)
    }

    fn force(&self) -> bool {
        let from_query = self
            .query_param("force")
            .map(|v| flag_value(&Value::String(v.to_string())))
            .unwrap_or(false);
        from_query || self.body.get("force").map(flag_value).unwrap_or(false)
    }
}

/// Decode an `application/x-www-form-urlencoded` query string.
fn parse_query(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self {
                status,
                body: Some(body),
            },
            Err(e) => Self::error(&Error::Store(format!("cannot encode response: {e}"))),
        }
    }

    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    fn error(err: &Error) -> Self {
        let body = match err {
            Error::Conflict { held_by } => json!({ "error": err.to_string(), "heldBy": held_by }),
            _ => json!({ "error": err.to_string() }),
        };
        Self {
            status: status_code(err),
            body: Some(body),
        }
    }
}

/// Session configuration as posted by clients. Absent fields fall back to a
/// base configuration.
#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ConfigBody {
    #[serde(alias = "db_path", alias = "dbPath")]
    data_source_path: Option<PathBuf>,
    #[serde(alias = "table_name")]
    table_name: Option<String>,
    #[serde(alias = "id_field")]
    id_field: Option<String>,
    #[serde(alias = "parent_field")]
    parent_field: Option<String>,
    #[serde(alias = "order_field")]
    order_field: Option<String>,
    #[serde(alias = "auto_bootstrap")]
    auto_bootstrap: Option<Value>,
}

impl ConfigBody {
    fn over(self, base: &Config) -> Config {
        Config {
            data_source_path: self
                .data_source_path
                .unwrap_or_else(|| base.data_source_path.clone()),
            table_name: self.table_name.unwrap_or_else(|| base.table_name.clone()),
            id_field: self.id_field.unwrap_or_else(|| base.id_field.clone()),
            parent_field: self.parent_field.unwrap_or_else(|| base.parent_field.clone()),
            order_field: self.order_field.unwrap_or_else(|| base.order_field.clone()),
            auto_bootstrap: self
                .auto_bootstrap
                .as_ref()
                .map_or(base.auto_bootstrap, flag_value),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody<'a> {
    session_id: &'a SessionId,
    config: &'a Config,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveBody {
    #[serde(default)]
    parent_id: Option<FieldValue>,
    #[serde(default)]
    after: Option<NodeId>,
    #[serde(default)]
    placement: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorderBody {
    #[serde(default)]
    parent_id: Option<FieldValue>,
    order: Vec<NodeId>,
}

#[derive(Deserialize)]
struct RestoreBody {
    nodes: Vec<Node>,
}

/// A missing body reads as an empty object.
fn parse_body<T: DeserializeOwned>(body: &Value) -> Result<T> {
    let body = match body {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("invalid request body: {e}")))
}

fn parse_fields(body: &Value) -> Result<Fields> {
    if !body.is_object() {
        return Err(Error::Validation("request body must be a JSON object".into()));
    }
    parse_body(body)
}

fn parse_node_id(segment: &str) -> Result<NodeId> {
    segment
        .parse::<i64>()
        .map(NodeId)
        .map_err(|_| Error::Validation(format!("node id {segment:?} is not an integer")))
}

fn parse_parent(value: Option<FieldValue>) -> Result<Option<NodeId>> {
    value.map_or(Ok(None), |v| v.as_parent())
}

fn decode_segment(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::Validation(format!("path segment {segment:?} is not UTF-8")))
}

/// Dispatch one request. `defaults` fills configuration fields a session
/// request leaves out. A leading `/api` segment is optional.
pub fn route<B: StoreBackend, C: Clock>(
    coordinator: &AccessCoordinator<B, C>,
    defaults: &Config,
    request: &ApiRequest,
) -> ApiResponse {
    match dispatch(coordinator, defaults, request) {
        Ok(response) => response,
        Err(err) => ApiResponse::error(&err),
    }
}

fn dispatch<B: StoreBackend, C: Clock>(
    coordinator: &AccessCoordinator<B, C>,
    defaults: &Config,
    request: &ApiRequest,
) -> Result<ApiResponse> {
    let mut segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&"api") {
        segments.remove(0);
    }

    match (request.method, segments.as_slice()) {
        (Method::Get, ["session"]) => Ok(ApiResponse::json(200, &coordinator.list_sessions())),
        (Method::Post, ["session"]) => {
            let config = parse_body::<ConfigBody>(&request.body)?.over(defaults);
            let session = coordinator.open_session(config, request.force())?;
            Ok(ApiResponse::json(
                201,
                &SessionBody {
                    session_id: &session.session_id,
                    config: &session.config,
                },
            ))
        }
        (Method::Put, ["session", id]) => {
            let id = SessionId::from(*id);
            let base = coordinator
                .registry()
                .lookup(&id)
                .map_or_else(|| defaults.clone(), |s| s.config);
            let config = parse_body::<ConfigBody>(&request.body)?.over(&base);
            let update = coordinator.update_session(&id, config, request.force())?;
            let status = if update.created { 201 } else { 200 };
            Ok(ApiResponse::json(
                status,
                &SessionBody {
                    session_id: &update.session.session_id,
                    config: &update.session.config,
                },
            ))
        }
        (Method::Delete, ["session"]) => {
            let id = request
                .session_id()
                .ok_or_else(|| Error::Validation("session id required".into()))?;
            coordinator.close_session(&id);
            Ok(ApiResponse::empty(204))
        }
        (Method::Delete, ["session", id]) => {
            coordinator.close_session(&SessionId::from(*id));
            Ok(ApiResponse::empty(204))
        }
        (Method::Get, ["tables"]) | (Method::Get, ["config", "tables"]) => {
            let path = ["dbPath", "db_path", "path"]
                .iter()
                .find_map(|name| request.query_param(name))
                .unwrap_or_default();
            let listing = coordinator.list_tables(Path::new(path.trim()))?;
            Ok(ApiResponse::json(200, &listing))
        }
        (_, ["nodes", ..])
        | (_, ["reorder"])
        | (_, ["sort-order", "rebuild"])
        | (_, ["restore"])
        | (_, ["meta"])
        | (_, ["foreign", _]) => {
            let session = request
                .session_id()
                .ok_or_else(|| Error::Expired("no session id supplied".into()))?;
            node_route(coordinator, &session, request, &segments)
        }
        _ => Ok(ApiResponse::json(
            404,
            &json!({ "error": format!("no route for {:?} {}", request.method, request.path) }),
        )),
    }
}

fn node_route<B: StoreBackend, C: Clock>(
    coordinator: &AccessCoordinator<B, C>,
    session: &SessionId,
    request: &ApiRequest,
    segments: &[&str],
) -> Result<ApiResponse> {
    let body = &request.body;
    match (request.method, segments) {
        (Method::Get, ["nodes"]) => {
            let nodes = coordinator.with_resource(session, |store| store.list_all())?;
            Ok(ApiResponse::json(200, &nodes))
        }
        (Method::Post, ["nodes"]) => {
            let fields = parse_fields(body)?;
            let node = coordinator.with_resource(session, |store| store.insert(fields))?;
            Ok(ApiResponse::json(201, &node))
        }
        (Method::Get, ["nodes", id]) => {
            let id = parse_node_id(id)?;
            let node = coordinator.with_resource(session, |store| store.get(id))?;
            Ok(ApiResponse::json(200, &node))
        }
        (Method::Put, ["nodes", id]) => {
            let id = parse_node_id(id)?;
            let fields = parse_fields(body)?;
            let node = coordinator.with_resource(session, |store| store.update(id, fields))?;
            Ok(ApiResponse::json(200, &node))
        }
        (Method::Delete, ["nodes", id]) => {
            let id = parse_node_id(id)?;
            coordinator.with_resource(session, |store| store.delete(id))?;
            Ok(ApiResponse::empty(204))
        }
        (Method::Get, ["nodes", id, "ancestors"]) => {
            let id = parse_node_id(id)?;
            let ids = coordinator.with_resource(session, |store| store.get_ancestors(id))?;
            Ok(ApiResponse::json(200, &ids))
        }
        (Method::Get, ["nodes", id, "descendants"]) => {
            let id = parse_node_id(id)?;
            let ids = coordinator.with_resource(session, |store| store.get_descendants(id))?;
            Ok(ApiResponse::json(200, &ids))
        }
        (Method::Post, ["nodes", id, "move"]) => {
            let id = parse_node_id(id)?;
            let req: MoveBody = parse_body(body)?;
            let parent = parse_parent(req.parent_id)?;
            let placement = match (req.after, req.placement.as_deref()) {
                (Some(anchor), _) => Placement::After(anchor),
                (None, Some("first")) => Placement::First,
                (None, Some("last")) | (None, None) => Placement::Last,
                (None, Some(other)) => {
                    return Err(Error::Validation(format!("unknown placement {other:?}")))
                }
            };
            let node =
                coordinator.with_resource(session, |store| store.move_node(id, parent, placement))?;
            Ok(ApiResponse::json(200, &node))
        }
        (Method::Post, ["reorder"]) => {
            let req: ReorderBody = parse_body(body)?;
            let parent = parse_parent(req.parent_id)?;
            coordinator.with_resource(session, |store| store.reorder_siblings(parent, &req.order))?;
            Ok(ApiResponse::empty(204))
        }
        (Method::Post, ["sort-order", "rebuild"]) => {
            let updated = coordinator.with_resource(session, |store| store.rebuild_order())?;
            Ok(ApiResponse::json(200, &json!({ "updated": updated })))
        }
        (Method::Post, ["restore"]) => {
            let req: RestoreBody = parse_body(body)?;
            let restored = coordinator.with_resource(session, |store| store.restore(req.nodes))?;
            Ok(ApiResponse::json(200, &json!({ "restored": restored })))
        }
        (Method::Get, ["meta"]) => {
            let meta = coordinator.with_resource(session, |store| store.table_meta())?;
            Ok(ApiResponse::json(200, &meta))
        }
        (Method::Get, ["foreign", column]) => {
            let column = decode_segment(column)?;
            let options = coordinator.with_resource(session, |store| store.foreign_options(&column))?;
            Ok(ApiResponse::json(200, &options))
        }
        _ => Ok(ApiResponse::json(
            405,
            &json!({ "error": format!("{:?} not allowed on {}", request.method, request.path) }),
        )),
    }
}
