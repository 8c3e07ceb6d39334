//! HTTP API shared by the host server and the ESP32 HTTP server.
//!
//! Handlers are plain functions over a [`Board`]; transports only decode the
//! request line and body and encode the returned [`ApiResponse`].

use std::{borrow::Cow, time::Duration};

use log::debug;
use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};

use crate::{
    board::Board,
    error::{BoardError, ValidationError},
    gpio::Gpio,
    store::{Applied, StorageBackend},
};

/// Delay between acknowledging a reboot request and restarting.
pub const REBOOT_DELAY: Duration = Duration::from_secs(1);

const NOT_PERSISTED: &str = "Change applied but could not be saved; it will be lost on reboot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApiRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Set when the transport should restart the device after replying.
    pub reboot_after: Option<Duration>,
}

impl ApiResponse {
    pub fn ok(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            reboot_after: None,
        }
    }

    pub fn message(status: u16, message: impl Into<String>) -> Self {
        Self::ok(status, json!({ "message": message.into() }))
    }

    fn applied(status: u16, applied: Applied) -> Self {
        let mut body = Map::new();
        body.insert("message".into(), Value::String(applied.message));
        if !applied.persisted {
            body.insert("warning".into(), Value::String(NOT_PERSISTED.into()));
        }
        Self::ok(status, Value::Object(body))
    }

    fn error(err: &BoardError) -> Self {
        Self::message(err.status(), err.to_string())
    }

    /// Adds a field to an object body.
    fn with(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(body) = &mut self.body {
            body.insert(key.to_string(), value);
        }
        self
    }

    fn from_result(status: u16, result: Result<Applied, BoardError>) -> Self {
        match result {
            Ok(applied) => Self::applied(status, applied),
            Err(err) => Self::error(&err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route<'a> {
    Networks,
    Relays,
    Relay(Cow<'a, str>),
    RelayPin(Cow<'a, str>),
    Indicator,
    Status,
    Reboot,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        let path = path.strip_suffix('/').unwrap_or(path);
        let rest = path.strip_prefix("/api/")?;
        let segments: Vec<&str> = rest.split('/').collect();

        match segments.as_slice() {
            ["config", "nets"] => Some(Self::Networks),
            ["config", "indicator"] => Some(Self::Indicator),
            ["relay"] => Some(Self::Relays),
            ["relay", name] => relay_name(name).map(Self::Relay),
            ["relay", name, "pin"] => relay_name(name).map(Self::RelayPin),
            ["system", "status"] => Some(Self::Status),
            ["system", "reboot"] => Some(Self::Reboot),
            _ => None,
        }
    }
}

/// Path segments arrive percent-encoded; names are matched decoded.
fn relay_name(segment: &str) -> Option<Cow<'_, str>> {
    let name = percent_decode_str(segment).decode_utf8().ok()?;
    (!name.is_empty()).then_some(name)
}

pub struct RequestRouter;

impl RequestRouter {
    pub fn dispatch<G: Gpio, B: StorageBackend>(
        board: &mut Board<G, B>,
        request: ApiRequest<'_>,
    ) -> ApiResponse {
        debug!("{:?} {}", request.method, request.path);
        let Some(route) = Route::parse(request.path) else {
            return ApiResponse::message(404, format!("No resource at [{}]", request.path));
        };

        let body = request.body;
        match (route, request.method) {
            (Route::Networks, Method::Get) => list_networks(board),
            (Route::Networks, Method::Post) => add_network(board, body),
            (Route::Networks, Method::Put) => edit_network(board, body),
            (Route::Networks, Method::Delete) => delete_network(board, body),
            (Route::Relays, Method::Get) => list_relays(board),
            (Route::Relays, Method::Post) => add_relay(board, body),
            (Route::Relay(name), Method::Get) => get_relay(board, &name),
            (Route::Relay(name), Method::Put) => set_relay_state(board, &name, body),
            (Route::Relay(name), Method::Delete) => delete_relay(board, &name),
            (Route::RelayPin(name), Method::Put) => change_relay_pin(board, &name, body),
            (Route::Indicator, Method::Get) => get_indicator(board),
            (Route::Indicator, Method::Put) => set_indicator(board, body),
            (Route::Status, Method::Get) => status(board),
            (Route::Reboot, Method::Post) => reboot(),
            (_, method) => ApiResponse::message(
                405,
                format!("{method:?} is not supported on [{}]", request.path),
            ),
        }
    }
}

pub fn list_networks<G: Gpio, B: StorageBackend>(board: &Board<G, B>) -> ApiResponse {
    let ssids: Vec<&String> = board.config.networks.keys().collect();
    ApiResponse::ok(200, json!({ "saved_nets": ssids }))
}

pub fn add_network<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["ssid", "password"]).and_then(|payload| {
        let ssid = text(&payload, "ssid")?;
        let password = text(&payload, "password")?;
        board.store.add_network(&mut board.config, &ssid, &password)
    });
    ApiResponse::from_result(201, result)
}

pub fn edit_network<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["ssid", "password"]).and_then(|payload| {
        let ssid = text(&payload, "ssid")?;
        let password = text(&payload, "password")?;
        board.store.edit_network(&mut board.config, &ssid, &password)
    });
    ApiResponse::from_result(200, result)
}

pub fn delete_network<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["ssid"]).and_then(|payload| {
        let ssid = text(&payload, "ssid")?;
        board.store.delete_network(&mut board.config, &ssid)
    });
    ApiResponse::from_result(200, result)
}

pub fn list_relays<G: Gpio, B: StorageBackend>(board: &Board<G, B>) -> ApiResponse {
    let relays: Map<String, Value> = board
        .config
        .relays
        .iter()
        .map(|(name, relay)| (name.clone(), relay_json(relay.pin, relay.state)))
        .collect();
    ApiResponse::ok(200, Value::Object(relays))
}

pub fn add_relay<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["name", "pin"]).and_then(|payload| {
        let name = text(&payload, "name")?;
        let pin = pin(&payload, "pin")?;
        board.relays.add(&mut board.config, &board.store, &name, pin)
    });
    ApiResponse::from_result(201, result)
}

pub fn get_relay<G: Gpio, B: StorageBackend>(board: &Board<G, B>, name: &str) -> ApiResponse {
    match board.config.relays.get(name) {
        Some(relay) => ApiResponse::ok(200, relay_json(relay.pin, relay.state)),
        None => ApiResponse::message(404, format!("Relay [{name}] not found")),
    }
}

/// Replies carry `changed` so callers can tell a real switch from a no-op.
pub fn set_relay_state<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    name: &str,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["state"]).and_then(|payload| {
        let state = state(&payload, "state")?;
        board
            .relays
            .set_state(&mut board.config, &board.store, name, state)
    });
    match result {
        Ok(applied) => ApiResponse::applied(200, applied).with("changed", Value::Bool(true)),
        Err(err @ BoardError::NoOp(_)) => {
            ApiResponse::error(&err).with("changed", Value::Bool(false))
        }
        Err(err) => ApiResponse::error(&err),
    }
}

pub fn delete_relay<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    name: &str,
) -> ApiResponse {
    let result = board.relays.delete(&mut board.config, &board.store, name);
    ApiResponse::from_result(200, result)
}

pub fn change_relay_pin<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    name: &str,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["pin"]).and_then(|payload| {
        let pin = pin(&payload, "pin")?;
        board
            .relays
            .change_pin(&mut board.config, &board.store, name, pin)
    });
    ApiResponse::from_result(200, result)
}

pub fn get_indicator<G: Gpio, B: StorageBackend>(board: &Board<G, B>) -> ApiResponse {
    ApiResponse::ok(200, json!({ "custom_led_pin": board.config.indicator_pin }))
}

pub fn set_indicator<G: Gpio, B: StorageBackend>(
    board: &mut Board<G, B>,
    body: &[u8],
) -> ApiResponse {
    let result = parse_body(body, &["pin"]).and_then(|payload| {
        let pin = pin(&payload, "pin")?;
        board.set_indicator_pin(pin)
    });
    ApiResponse::from_result(200, result)
}

pub fn status<G: Gpio, B: StorageBackend>(board: &Board<G, B>) -> ApiResponse {
    let connectivity = match board.connectivity() {
        Some(report) => match serde_json::to_value(report) {
            Ok(report) => report,
            Err(err) => return ApiResponse::message(500, err.to_string()),
        },
        None => json!({ "state": "init" }),
    };
    ApiResponse::ok(
        200,
        json!({
            "connectivity": connectivity,
            "indicator": {
                "pin": board.config.indicator_pin,
                "lit": board.indicator().is_some_and(|led| led.is_lit()),
            },
            "relays": board.config.relays.len(),
            "saved_nets": board.config.networks.len(),
        }),
    )
}

pub fn reboot() -> ApiResponse {
    ApiResponse {
        reboot_after: Some(REBOOT_DELAY),
        ..ApiResponse::message(
            202,
            format!("Rebooting in {} second(s)", REBOOT_DELAY.as_secs()),
        )
    }
}

fn relay_json(pin: u8, state: bool) -> Value {
    json!({ "pin": pin, "state": u8::from(state) })
}

/// Decodes a JSON object body and checks that every `required` field is present.
/// An empty body counts as an empty object.
fn parse_body(body: &[u8], required: &[&str]) -> Result<Map<String, Value>, BoardError> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(payload)) => payload,
            Ok(other) => {
                return Err(ValidationError::MalformedBody(format!("got {other}")).into());
            }
            Err(err) => return Err(ValidationError::MalformedBody(err.to_string()).into()),
        }
    };
    require(&payload, required)?;
    Ok(payload)
}

fn require(payload: &Map<String, Value>, fields: &[&str]) -> Result<(), ValidationError> {
    match fields
        .iter()
        .find(|field| payload.get(**field).map_or(true, Value::is_null))
    {
        Some(field) => Err(ValidationError::MissingField(field.to_string())),
        None => Ok(()),
    }
}

/// Strings pass through and numbers are stringified, so `{"name": 5}` names relay "5".
fn text(payload: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match payload.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        _ => Err(ValidationError::invalid(field, "expected a string")),
    }
}

fn pin(payload: &Map<String, Value>, field: &str) -> Result<u8, ValidationError> {
    let pin = match payload.get(field) {
        Some(Value::Number(value)) => value.as_u64().and_then(|pin| u8::try_from(pin).ok()),
        Some(Value::String(value)) => value.trim().parse().ok(),
        _ => None,
    };
    pin.ok_or_else(|| ValidationError::invalid(field, "expected a pin number 0-255"))
}

fn state(payload: &Map<String, Value>, field: &str) -> Result<bool, ValidationError> {
    let state = match payload.get(field) {
        Some(Value::Bool(value)) => Some(*value),
        Some(Value::Number(value)) => match value.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Some(Value::String(value)) => match value.trim().to_ascii_lowercase().as_str() {
            "0" | "off" | "false" => Some(false),
            "1" | "on" | "true" => Some(true),
            _ => None,
        },
        _ => None,
    };
    state.ok_or_else(|| ValidationError::invalid(field, "expected 0 or 1"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        sim::{MemoryBackend, PinMode, SimGpio},
        store::ConfigStore,
    };

    struct Fixture {
        gpio: SimGpio,
        backend: MemoryBackend,
        board: Board<SimGpio, MemoryBackend>,
    }

    fn fixture() -> Fixture {
        let gpio = SimGpio::default();
        let backend = MemoryBackend::default();
        Fixture {
            board: Board::boot(gpio.clone(), ConfigStore::new(backend.clone())),
            gpio,
            backend,
        }
    }

    impl Fixture {
        fn call(&mut self, method: Method, path: &str, body: Value) -> ApiResponse {
            let body = if body.is_null() {
                Vec::new()
            } else {
                body.to_string().into_bytes()
            };
            RequestRouter::dispatch(
                &mut self.board,
                ApiRequest {
                    method,
                    path,
                    body: &body,
                },
            )
        }
    }

    #[test]
    fn relay_scenario() {
        let mut f = fixture();

        let created = f.call(Method::Post, "/api/relay", json!({"name": "5", "pin": 10}));
        assert_eq!(created.status, 201);

        let first = f.call(Method::Put, "/api/relay/5", json!({"state": 1}));
        assert_eq!(first.status, 200);
        assert_eq!(first.body["changed"], json!(true));
        assert_eq!(f.gpio.mode(10), Some(PinMode::Output(true)));

        let second = f.call(Method::Put, "/api/relay/5", json!({"state": 1}));
        assert_eq!(second.status, 406);
        assert_eq!(second.body["changed"], json!(false));
        assert_eq!(f.gpio.mode(10), Some(PinMode::Output(true)));

        let missing = f.call(Method::Delete, "/api/config/nets", json!({"ssid": "x"}));
        assert_eq!(missing.status, 404);
    }

    #[test]
    fn missing_field_is_named() {
        let mut f = fixture();
        let response = f.call(Method::Post, "/api/relay", json!({"name": "a"}));
        assert_eq!(response.status, 400);
        assert_eq!(response.body, json!({"message": "Field [pin] not provided."}));

        let response = f.call(Method::Put, "/api/relay/a", Value::Null);
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body,
            json!({"message": "Field [state] not provided."})
        );
    }

    #[test]
    fn malformed_and_invalid_bodies_are_rejected() {
        let mut f = fixture();
        let garbage = RequestRouter::dispatch(
            &mut f.board,
            ApiRequest {
                method: Method::Post,
                path: "/api/config/nets",
                body: b"ssid=home",
            },
        );
        assert_eq!(garbage.status, 400);

        let array = f.call(Method::Post, "/api/relay", json!([1, 2]));
        assert_eq!(array.status, 400);

        let pin = f.call(Method::Post, "/api/relay", json!({"name": "a", "pin": 300}));
        assert_eq!(pin.status, 400);

        f.call(Method::Post, "/api/relay", json!({"name": "a", "pin": 4}));
        let state = f.call(Method::Put, "/api/relay/a", json!({"state": 2}));
        assert_eq!(state.status, 400);
        assert!(f.board.config.relays.contains_key("a"));
    }

    #[test]
    fn numeric_names_and_string_values_are_coerced() {
        let mut f = fixture();
        let created = f.call(Method::Post, "/api/relay", json!({"name": 7, "pin": "12"}));
        assert_eq!(created.status, 201);

        let switched = f.call(Method::Put, "/api/relay/7/", json!({"state": "on"}));
        assert_eq!(switched.status, 200);
        assert_eq!(
            f.call(Method::Get, "/api/relay/7", Value::Null).body,
            json!({"pin": 12, "state": 1})
        );
    }

    #[test]
    fn escaped_relay_names_are_decoded() {
        let mut f = fixture();
        let created = f.call(
            Method::Post,
            "/api/relay",
            json!({"name": "living room", "pin": 5}),
        );
        assert_eq!(created.status, 201);

        let switched = f.call(Method::Put, "/api/relay/living%20room", json!({"state": 1}));
        assert_eq!(switched.status, 200);
        assert_eq!(
            f.call(Method::Get, "/api/relay/living%20room/", Value::Null).body,
            json!({"pin": 5, "state": 1})
        );
        let moved = f.call(Method::Put, "/api/relay/living%20room/pin", json!({"pin": 6}));
        assert_eq!(moved.status, 200);
        assert_eq!(f.board.config.relays["living room"].pin, 6);

        assert_eq!(f.call(Method::Get, "/api/relay/%FF", Value::Null).status, 404);
        assert_eq!(f.call(Method::Put, "/api/relay//pin", json!({"pin": 7})).status, 404);
    }

    #[test]
    fn unknown_paths_and_verbs() {
        let mut f = fixture();
        assert_eq!(f.call(Method::Get, "/api/nope", Value::Null).status, 404);
        assert_eq!(f.call(Method::Get, "/index.html", Value::Null).status, 404);
        assert_eq!(f.call(Method::Delete, "/api/relay", Value::Null).status, 405);
        assert_eq!(f.call(Method::Get, "/api/system/reboot", Value::Null).status, 405);
        assert_eq!(f.call(Method::Get, "/api/relay/ghost", Value::Null).status, 404);
        assert_eq!(
            f.call(Method::Get, "/api/config/nets/?verbose=1", Value::Null)
                .status,
            200
        );
    }

    #[test]
    fn network_lifecycle() {
        let mut f = fixture();
        let body = json!({"ssid": "home", "password": "secret"});

        assert_eq!(f.call(Method::Post, "/api/config/nets", body.clone()).status, 201);
        assert_eq!(f.call(Method::Post, "/api/config/nets", body.clone()).status, 409);
        assert_eq!(f.call(Method::Put, "/api/config/nets", body).status, 406);
        assert_eq!(
            f.call(
                Method::Put,
                "/api/config/nets",
                json!({"ssid": "home", "password": "changed"})
            )
            .status,
            200
        );
        assert_eq!(
            f.call(Method::Get, "/api/config/nets", Value::Null).body,
            json!({"saved_nets": ["home"]})
        );
        assert_eq!(
            f.call(Method::Delete, "/api/config/nets", json!({"ssid": "home"}))
                .status,
            200
        );
        assert!(f.board.store.load().networks.is_empty());
    }

    #[test]
    fn relay_listing_and_pin_changes() {
        let mut f = fixture();
        f.call(Method::Post, "/api/relay", json!({"name": "pump", "pin": 5}));
        f.call(Method::Post, "/api/relay", json!({"name": "fan", "pin": 6}));

        assert_eq!(
            f.call(Method::Post, "/api/relay", json!({"name": "x", "pin": 5}))
                .status,
            409
        );
        assert_eq!(
            f.call(Method::Put, "/api/relay/fan/pin", json!({"pin": 5}))
                .status,
            409
        );
        assert_eq!(
            f.call(Method::Put, "/api/relay/fan/pin", json!({"pin": 6}))
                .status,
            406
        );
        assert_eq!(
            f.call(Method::Put, "/api/relay/fan/pin", json!({"pin": 9}))
                .status,
            200
        );
        assert_eq!(
            f.call(Method::Get, "/api/relay", Value::Null).body,
            json!({
                "fan": {"pin": 9, "state": 0},
                "pump": {"pin": 5, "state": 0},
            })
        );
        assert_eq!(f.call(Method::Delete, "/api/relay/pump", Value::Null).status, 200);
        assert_eq!(f.call(Method::Delete, "/api/relay/pump", Value::Null).status, 404);
    }

    #[test]
    fn hardware_failure_is_internal_error() {
        let mut f = fixture();
        f.gpio.fail_pin(13);
        let response = f.call(Method::Post, "/api/relay", json!({"name": "a", "pin": 13}));
        assert_eq!(response.status, 500);
        assert!(f.board.config.relays.is_empty());
    }

    #[test]
    fn unsaved_change_carries_warning() {
        let mut f = fixture();
        f.backend.fail_writes(true);
        let response = f.call(Method::Post, "/api/relay", json!({"name": "a", "pin": 4}));
        assert_eq!(response.status, 201);
        assert_eq!(response.body["warning"], json!(NOT_PERSISTED));
        assert!(f.board.config.relays.contains_key("a"));
    }

    #[test]
    fn indicator_endpoints() {
        let mut f = fixture();
        assert_eq!(
            f.call(Method::Get, "/api/config/indicator", Value::Null).body,
            json!({"custom_led_pin": 2})
        );
        assert_eq!(
            f.call(Method::Put, "/api/config/indicator", json!({"pin": 2}))
                .status,
            406
        );
        assert_eq!(
            f.call(Method::Put, "/api/config/indicator", json!({"pin": 22}))
                .status,
            200
        );
        assert_eq!(f.gpio.mode(2), Some(PinMode::Input));
        assert_eq!(f.board.store.load().indicator_pin, 22);
    }

    #[test]
    fn status_and_reboot() {
        let mut f = fixture();
        let status = f.call(Method::Get, "/api/system/status", Value::Null);
        assert_eq!(status.status, 200);
        assert_eq!(status.body["connectivity"], json!({"state": "init"}));
        assert_eq!(status.reboot_after, None);

        let reboot = f.call(Method::Post, "/api/system/reboot", Value::Null);
        assert_eq!(reboot.status, 202);
        assert_eq!(reboot.reboot_after, Some(REBOOT_DELAY));
    }

    #[test]
    fn method_names_parse_case_insensitively() {
        assert_eq!(Method::parse("get"), Some(Method::Get));
        assert_eq!(Method::parse("DELETE"), Some(Method::Delete));
        assert_eq!(Method::parse("PATCH"), None);
    }
}
