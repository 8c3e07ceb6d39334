use core::convert::TryInto;
use std::{
    fmt::Display,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, Level, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{esp, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde_json::Value;

use relay_common::{
    connection::LinkInfo,
    router::{ApiRequest, Method as ApiMethod, RequestRouter},
    AccessPointConfig, Board, ConfigStore, ConnectionPolicy, Gpio, HardwareError, IpInfo,
    LinkStatus, OutputPin, Radio, RadioError, ScanEntry, StorageBackend, StoreError,
};

const NVS_NAMESPACE: &str = "relay";
const NVS_BUFFER_LEN: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
const AP_CHANNEL: u8 = 1;

type EspBoard = Board<EspGpio, NvsBackend>;

/// Relay and indicator pins are claimed by number at runtime, so drivers are
/// built from raw GPIO numbers instead of typed peripherals.
struct EspGpio;

struct EspPin {
    pin: u8,
    driver: PinDriver<'static, AnyIOPin, Output>,
}

impl OutputPin for EspPin {
    fn set_level(&mut self, high: bool) -> Result<(), HardwareError> {
        self.driver
            .set_level(Level::from(high))
            .map_err(|err| HardwareError::new(self.pin, err.to_string()))
    }
}

impl Gpio for EspGpio {
    type Output = EspPin;

    fn output(&mut self, pin: u8, high: bool) -> Result<EspPin, HardwareError> {
        // SAFETY: every pin number is owned by at most one relay or the indicator,
        // enforced by the config invariants.
        let driver = unsafe { PinDriver::output(AnyIOPin::new(i32::from(pin))) };
        let mut driver = driver.map_err(|err| HardwareError::new(pin, err.to_string()))?;
        driver
            .set_level(Level::from(high))
            .map_err(|err| HardwareError::new(pin, err.to_string()))?;
        Ok(EspPin { pin, driver })
    }

    fn quiesce(&mut self, pin: u8) -> Result<(), HardwareError> {
        let hardware = |err: EspError| HardwareError::new(pin, err.to_string());
        // SAFETY: the previous owner's driver has been dropped.
        let mut driver = unsafe { PinDriver::output(AnyIOPin::new(i32::from(pin))) }
            .map_err(hardware)?;
        driver.set_low().map_err(hardware)?;
        let driver = driver.into_input().map_err(hardware)?;
        // Dropping the driver would reset the pin; leave it configured as input.
        core::mem::forget(driver);
        Ok(())
    }
}

#[derive(Clone)]
struct NvsBackend {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsBackend {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(backend_error)
    }
}

impl StorageBackend for NvsBackend {
    fn read(&self, table: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lock.lock().map_err(backend_error)?;
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; NVS_BUFFER_LEN];
        let value = nvs.get_str(table, &mut buffer).map_err(backend_error)?;
        Ok(value.map(|value| value.as_bytes().to_vec()))
    }

    fn write(&self, table: &str, payload: &[u8]) -> Result<(), StoreError> {
        let payload = std::str::from_utf8(payload).map_err(backend_error)?;
        let _guard = self.lock.lock().map_err(backend_error)?;
        let mut nvs = self.open()?;
        nvs.set_str(table, payload).map_err(backend_error)
    }
}

fn backend_error(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start().context("failed to start wifi")?;
        // Modem sleep delays inbound HTTP requests by whole beacon intervals.
        if let Err(err) = esp!(unsafe {
            esp_idf_svc::sys::esp_wifi_set_ps(esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_NONE)
        }) {
            warn!("wifi power save left enabled: {err}");
        }
        Ok(Self { wifi })
    }
}

impl Radio for EspRadio {
    fn scan(&mut self) -> Result<Vec<ScanEntry>, RadioError> {
        let found = self.wifi.scan().map_err(radio_error("scan"))?;
        Ok(found
            .into_iter()
            .map(|ap| ScanEntry {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
                encrypted: ap
                    .auth_method
                    .is_some_and(|method| method != AuthMethod::None),
            })
            .collect())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError(format!("ssid [{ssid}] too long")))?,
            password: password
                .try_into()
                .map_err(|_| RadioError("password too long".into()))?,
            auth_method: AuthMethod::WPAWPA2Personal,
            ..Default::default()
        });
        self.wifi
            .set_configuration(&configuration)
            .map_err(radio_error("configure station"))?;
        // Non-blocking; progress is observed through `status`.
        self.wifi
            .wifi_mut()
            .connect()
            .map_err(radio_error("connect"))
    }

    /// The driver does not expose an authentication failure before its own
    /// retries give up, so a wrong password surfaces as a polling timeout.
    fn status(&mut self) -> LinkStatus {
        match self.wifi.is_connected() {
            Ok(true) => match self.wifi.wifi().sta_netif().is_up() {
                Ok(true) => LinkStatus::GotIp,
                _ => LinkStatus::Connecting,
            },
            Ok(false) => LinkStatus::Connecting,
            Err(err) => {
                warn!("wifi status unavailable: {err}");
                LinkStatus::ConnectFailed
            }
        }
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.wifi_mut().disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn station_info(&mut self) -> Option<IpInfo> {
        let info = self.wifi.wifi().sta_netif().get_ip_info().ok()?;
        Some(IpInfo {
            ip: info.ip,
            netmask: Ipv4Addr::from(info.subnet.mask),
            gateway: info.subnet.gateway,
            dns: info.dns,
        })
    }

    fn disable_access_point(&mut self) -> Result<(), RadioError> {
        let rc = unsafe {
            esp_idf_svc::sys::esp_wifi_set_mode(esp_idf_svc::sys::wifi_mode_t_WIFI_MODE_STA)
        };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        Err(RadioError(format!("esp_wifi_set_mode failed with code {rc}")))
    }

    fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        if let Err(err) = self.wifi.stop() {
            warn!("wifi stop before AP start failed: {err}");
        }

        let mask = Mask::try_from(config.ip.netmask)
            .map_err(|_| RadioError(format!("invalid AP netmask {}", config.ip.netmask)))?;
        let netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: config.ip.ip,
                    mask,
                },
                dhcp_enabled: true,
                dns: config.ip.dns,
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        })
        .map_err(radio_error("create AP netif"))?;
        self.wifi
            .wifi_mut()
            .swap_netif_ap(netif)
            .map_err(radio_error("install AP netif"))?;

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: config
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError("AP ssid too long".into()))?,
                password: config
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError("AP password too long".into()))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: AP_CHANNEL,
                ..Default::default()
            }))
            .map_err(radio_error("configure AP"))?;
        self.wifi.start().map_err(radio_error("start AP"))?;
        self.wifi
            .wait_netif_up()
            .map_err(radio_error("AP netif up"))
    }

    fn mac_address(&mut self) -> Result<[u8; 6], RadioError> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_mac()
            .map_err(radio_error("read MAC"))
    }
}

fn radio_error<E: Display>(operation: &'static str) -> impl Fn(E) -> RadioError {
    move |err| RadioError(format!("{operation}: {err}"))
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let store = ConfigStore::new(NvsBackend::new(nvs_partition.clone()));
    let mut board = Board::boot(EspGpio, store);
    ensure_wifi_defaults(&mut board);

    let mut radio = EspRadio::new(modem, sys_loop, nvs_partition).context("wifi startup failed")?;
    let report = board
        .connect(&mut radio, ConnectionPolicy::default(), thread::sleep)
        .context("failed to bring up networking")?;
    match &report.link {
        LinkInfo::Station { ssid, ip } => info!("wifi connected to `{ssid}`: {ip:?}"),
        LinkInfo::AccessPoint { ssid, ip } => {
            warn!("no known network reachable; serving AP `{ssid}` at {}", ip.ip)
        }
    }

    let watchdog = MainLoopWatchdog::subscribe(WATCHDOG_TIMEOUT)?;

    let board = Arc::new(Mutex::new(board));
    let server = create_http_server(board)?;

    // Keep services alive for the program lifetime.
    let _radio = radio;
    let _server = server;

    loop {
        watchdog.feed();
        thread::sleep(Duration::from_secs(1));
    }
}

fn ensure_wifi_defaults(board: &mut EspBoard) {
    if !board.config.networks.is_empty() {
        return;
    }
    let Some(ssid) = option_env!("RELAY_WIFI_SSID") else {
        return;
    };
    let password = option_env!("RELAY_WIFI_PASS").unwrap_or_default();
    if let Err(err) = board.store.add_network(&mut board.config, ssid, password) {
        warn!("build-time wifi credential rejected: {err}");
    }
}

fn create_http_server(board: Arc<Mutex<EspBoard>>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for (method, api_method) in [
        (Method::Get, ApiMethod::Get),
        (Method::Post, ApiMethod::Post),
        (Method::Put, ApiMethod::Put),
        (Method::Delete, ApiMethod::Delete),
    ] {
        let board = board.clone();
        server.fn_handler::<anyhow::Error, _>("/api/*", method, move |mut req| {
            let body = match request_body(&mut req) {
                Ok(body) => body,
                Err(err) => {
                    let message = serde_json::json!({ "message": format!("{err:#}") });
                    return write_json(req, 400, &message);
                }
            };
            let path = req.uri().to_string();

            let response = {
                let mut board = board.lock().map_err(|_| anyhow!("board lock poisoned"))?;
                RequestRouter::dispatch(
                    &mut *board,
                    ApiRequest {
                        method: api_method,
                        path: &path,
                        body: &body,
                    },
                )
            };

            write_json(req, response.status, &response.body)?;
            if let Some(delay) = response.reboot_after {
                schedule_restart(delay);
            }
            Ok(())
        })?;
    }

    Ok(server)
}

/// Reads at most `MAX_HTTP_BODY` bytes; a declared length above that is refused
/// before anything is read.
fn request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let declared = req.content_len().unwrap_or(0);
    let len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= MAX_HTTP_BODY)
        .ok_or_else(|| anyhow!("request body of {declared} bytes exceeds {MAX_HTTP_BODY}"))?;

    let mut body = vec![0_u8; len];
    req.read_exact(&mut body)
        .map_err(|err| anyhow!("request body truncated: {err:?}"))?;
    Ok(body)
}

fn write_json(
    req: Request<&mut EspHttpConnection<'_>>,
    status: u16,
    payload: &Value,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn schedule_restart(delay: Duration) {
    let spawned = thread::Builder::new()
        .name("restart".into())
        .stack_size(4096)
        .spawn(move || {
            thread::sleep(delay);
            warn!("restarting on request");
            unsafe { esp_idf_svc::sys::esp_restart() }
        });
    if let Err(err) = spawned {
        warn!("failed to schedule restart: {err}");
    }
}

/// Task watchdog subscription for the thread that owns the main loop.
struct MainLoopWatchdog;

impl MainLoopWatchdog {
    /// Configures the task watchdog (keeping an existing configuration) and
    /// subscribes the calling thread to it.
    fn subscribe(timeout: Duration) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        already_ok(unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })
            .context("task watchdog init")?;
        already_ok(unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) })
            .context("task watchdog subscribe")?;
        info!("main loop watched with a {} s timeout", timeout.as_secs());
        Ok(Self)
    }

    fn feed(&self) {
        if let Err(err) = esp!(unsafe { esp_idf_svc::sys::esp_task_wdt_reset() }) {
            warn!("watchdog reset failed: {err}");
        }
    }
}

/// `ESP_ERR_INVALID_STATE` means the watchdog was already set up, which is fine.
fn already_ok(rc: esp_idf_svc::sys::esp_err_t) -> Result<(), EspError> {
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    esp!(rc)
}
