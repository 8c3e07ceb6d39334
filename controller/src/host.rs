use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use tokio::{net::TcpListener, signal, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use relay_common::{
    connection::LinkInfo,
    router::{self, ApiRequest, ApiResponse, Method, RequestRouter},
    sim::{SimGpio, SimRadio},
    Board, ConfigStore, ConnectionPolicy, ScanEntry, StorageBackend, StoreError,
};

const DEFAULT_SIM_MAC: [u8; 6] = [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01];
const DEFAULT_HTTP_PORT: u16 = 8080;
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

type HostBoard = Board<SimGpio, FileBackend>;

#[derive(Clone)]
struct AppState {
    board: Arc<Mutex<HostBoard>>,
}

struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    mac: [u8; 6],
    scan: Vec<ScanEntry>,
    passwords: BTreeMap<String, String>,
}

impl HostSettings {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.relay"));
        let http_port = match std::env::var("RELAY_HTTP_PORT") {
            Ok(value) => parse_port(&value)
                .with_context(|| format!("RELAY_HTTP_PORT [{value}] is not a TCP port"))?,
            Err(_) => DEFAULT_HTTP_PORT,
        };

        let mac = match std::env::var("RELAY_SIM_MAC") {
            Ok(value) => parse_mac(&value)
                .with_context(|| format!("RELAY_SIM_MAC [{value}] is not a MAC address"))?,
            Err(_) => DEFAULT_SIM_MAC,
        };
        let scan = match std::env::var("RELAY_SIM_SCAN") {
            Ok(value) => serde_json::from_str(&value).context("invalid RELAY_SIM_SCAN")?,
            Err(_) => Vec::new(),
        };
        let passwords = match std::env::var("RELAY_SIM_PASSWORDS") {
            Ok(value) => serde_json::from_str(&value).context("invalid RELAY_SIM_PASSWORDS")?,
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            data_dir,
            http_port,
            mac,
            scan,
            passwords,
        })
    }

    fn radio(&self) -> SimRadio {
        let mut radio = SimRadio::new(self.mac);
        radio.set_scan(self.scan.clone());
        for (ssid, password) in &self.passwords {
            radio.accept(ssid, password);
        }
        radio
    }
}

/// One JSON document per table under the data directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, table: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(table)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Written to a sibling temp file first so a crash never leaves a torn table.
    fn write(&self, table: &str, payload: &[u8]) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(table);
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, payload)?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env()?;
    info!("data directory {}", settings.data_dir.display());

    spawn_heartbeat();

    let store = ConfigStore::new(FileBackend::new(settings.data_dir.clone()));
    let mut radio = settings.radio();
    let board = tokio::task::spawn_blocking(move || -> anyhow::Result<HostBoard> {
        let mut board = Board::boot(SimGpio::default(), store);
        let report = board
            .connect(&mut radio, ConnectionPolicy::default(), std::thread::sleep)
            .context("failed to bring up networking")?;
        match &report.link {
            LinkInfo::Station { ssid, ip } => {
                info!("joined [{ssid}] with {ip:?}");
            }
            LinkInfo::AccessPoint { ssid, ip } => {
                info!("serving access point [{ssid}] at {}", ip.ip);
            }
        }
        Ok(board)
    })
    .await
    .context("boot task panicked")??;

    let app_state = AppState {
        board: Arc::new(Mutex::new(board)),
    };

    let app = Router::new()
        .route(
            "/api/config/nets",
            get(handle_list_networks)
                .post(handle_add_network)
                .put(handle_edit_network)
                .delete(handle_delete_network),
        )
        .route("/api/relay", get(handle_list_relays).post(handle_add_relay))
        .route(
            "/api/relay/{name}",
            get(handle_get_relay)
                .put(handle_set_relay_state)
                .delete(handle_delete_relay),
        )
        .route("/api/relay/{name}/pin", put(handle_change_relay_pin))
        .route(
            "/api/config/indicator",
            get(handle_get_indicator).put(handle_set_indicator),
        )
        .route("/api/system/status", get(handle_get_status))
        .route("/api/system/reboot", post(handle_reboot))
        .fallback(handle_fallback)
        .method_not_allowed_fallback(handle_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay server at {addr}"))?;

    info!("relay controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn spawn_heartbeat() {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut beats: u64 = 0;
        loop {
            interval.tick().await;
            beats += 1;
            if beats % 120 == 0 {
                debug!("heartbeat: alive for {} s", beats / 2);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn handle_list_networks(State(state): State<AppState>) -> Response {
    let board = state.board.lock().await;
    respond(router::list_networks(&*board))
}

async fn handle_add_network(State(state): State<AppState>, body: Bytes) -> Response {
    let mut board = state.board.lock().await;
    respond(router::add_network(&mut *board, &body))
}

async fn handle_edit_network(State(state): State<AppState>, body: Bytes) -> Response {
    let mut board = state.board.lock().await;
    respond(router::edit_network(&mut *board, &body))
}

async fn handle_delete_network(State(state): State<AppState>, body: Bytes) -> Response {
    let mut board = state.board.lock().await;
    respond(router::delete_network(&mut *board, &body))
}

async fn handle_list_relays(State(state): State<AppState>) -> Response {
    let board = state.board.lock().await;
    respond(router::list_relays(&*board))
}

async fn handle_add_relay(State(state): State<AppState>, body: Bytes) -> Response {
    let mut board = state.board.lock().await;
    respond(router::add_relay(&mut *board, &body))
}

async fn handle_get_relay(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let board = state.board.lock().await;
    respond(router::get_relay(&*board, &name))
}

async fn handle_set_relay_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let mut board = state.board.lock().await;
    respond(router::set_relay_state(&mut *board, &name, &body))
}

async fn handle_delete_relay(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let mut board = state.board.lock().await;
    respond(router::delete_relay(&mut *board, &name))
}

async fn handle_change_relay_pin(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let mut board = state.board.lock().await;
    respond(router::change_relay_pin(&mut *board, &name, &body))
}

async fn handle_get_indicator(State(state): State<AppState>) -> Response {
    let board = state.board.lock().await;
    respond(router::get_indicator(&*board))
}

async fn handle_set_indicator(State(state): State<AppState>, body: Bytes) -> Response {
    let mut board = state.board.lock().await;
    respond(router::set_indicator(&mut *board, &body))
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    let board = state.board.lock().await;
    respond(router::status(&*board))
}

async fn handle_reboot() -> Response {
    respond(router::reboot())
}

/// Trailing-slash variants, unknown paths and unsupported verbs.
async fn handle_fallback(
    State(state): State<AppState>,
    method: HttpMethod,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Some(method) = Method::parse(method.as_str()) else {
        return respond(ApiResponse::message(
            405,
            format!("{method} is not supported"),
        ));
    };
    let mut board = state.board.lock().await;
    respond(RequestRouter::dispatch(
        &mut *board,
        ApiRequest {
            method,
            path: uri.path(),
            body: &body,
        },
    ))
}

fn respond(response: ApiResponse) -> Response {
    if let Some(delay) = response.reboot_after {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            warn!("restarting on request");
            std::process::exit(0);
        });
    }
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse::<u16>().ok().filter(|port| *port != 0)
}

fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut octets = value.split([':', '-']);
    for byte in &mut mac {
        *byte = u8::from_str_radix(octets.next()?, 16).ok()?;
    }
    octets.next().is_none().then_some(mac)
}
