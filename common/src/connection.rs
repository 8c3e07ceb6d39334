//! Boot-time connectivity: join the strongest saved network or advertise an access point.

use std::{
    collections::{BTreeMap, VecDeque},
    net::Ipv4Addr,
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::NetworkCredential,
    error::RadioError,
    gpio::OutputPin,
    indicator::Indicator,
};

pub const AP_SSID_PREFIX: &str = "ESP Relay";
pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);
pub const AP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const AP_GATEWAY: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);
pub const AP_DNS: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i8,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    WrongPassword,
    NoApFound,
    ConnectFailed,
    GotIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub ip: IpInfo,
}

impl AccessPointConfig {
    /// Name and passphrase are both the hex station MAC, stable per device.
    pub fn for_mac(mac: [u8; 6]) -> Self {
        let hex: String = mac.iter().map(|byte| format!("{byte:02x}")).collect();
        Self {
            ssid: format!("{AP_SSID_PREFIX} {hex}"),
            password: hex,
            ip: IpInfo {
                ip: AP_ADDRESS,
                netmask: AP_NETMASK,
                gateway: AP_GATEWAY,
                dns: Some(AP_DNS),
            },
        }
    }
}

/// Wi-Fi capability used by the connection state machine.
pub trait Radio {
    fn scan(&mut self) -> Result<Vec<ScanEntry>, RadioError>;
    /// Starts joining `ssid`; completion is observed through [`Radio::status`].
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn status(&mut self) -> LinkStatus;
    fn disconnect(&mut self);
    fn station_info(&mut self) -> Option<IpInfo>;
    fn disable_access_point(&mut self) -> Result<(), RadioError>;
    fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError>;
    fn mac_address(&mut self) -> Result<[u8; 6], RadioError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_polls: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "ssid", rename_all = "snake_case")]
pub enum ConnectionState {
    Init,
    Scanning,
    Connecting(String),
    Connected,
    ApMode,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::ApMode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    GotIp,
    WrongPassword,
    ConnectFailed,
    NoApFound,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub ssid: String,
    pub rssi: i8,
    pub outcome: AttemptOutcome,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LinkInfo {
    Station { ssid: String, ip: Option<IpInfo> },
    AccessPoint { ssid: String, ip: IpInfo },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub state: ConnectionState,
    pub transitions: Vec<ConnectionState>,
    pub attempts: Vec<Attempt>,
    pub link: LinkInfo,
}

pub struct ConnectionManager {
    policy: ConnectionPolicy,
    state: ConnectionState,
    transitions: Vec<ConnectionState>,
    candidates: VecDeque<ScanEntry>,
    attempts: Vec<Attempt>,
}

impl ConnectionManager {
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Init,
            transitions: vec![ConnectionState::Init],
            candidates: VecDeque::new(),
            attempts: Vec::new(),
        }
    }

    /// Runs the state machine to a terminal state. Only a failure to start
    /// the fallback access point is an error.
    pub fn run<R, P, D>(
        mut self,
        radio: &mut R,
        networks: &BTreeMap<String, NetworkCredential>,
        indicator: Option<&mut Indicator<P>>,
        mut delay: D,
    ) -> Result<ConnectionReport, RadioError>
    where
        R: Radio,
        P: OutputPin,
        D: FnMut(Duration),
    {
        while !self.state.is_terminal() {
            let next = match &self.state {
                ConnectionState::Init if networks.is_empty() => {
                    info!("no saved networks");
                    ConnectionState::ApMode
                }
                ConnectionState::Init => ConnectionState::Scanning,
                ConnectionState::Scanning => {
                    let scanned = radio.scan().unwrap_or_else(|err| {
                        warn!("network scan failed: {err}");
                        Vec::new()
                    });
                    self.candidates = rank_candidates(scanned, networks).into();
                    self.next_candidate()
                }
                ConnectionState::Connecting(ssid) => {
                    let ssid = ssid.clone();
                    let outcome = self.attempt(radio, networks, &ssid, &mut delay);
                    if outcome == AttemptOutcome::GotIp {
                        ConnectionState::Connected
                    } else {
                        radio.disconnect();
                        self.next_candidate()
                    }
                }
                ConnectionState::Connected | ConnectionState::ApMode => break,
            };
            self.transition(next);
        }

        let link = match &self.state {
            ConnectionState::Connected => self.finish_connected(radio, indicator),
            _ => start_access_point(radio)?,
        };

        Ok(ConnectionReport {
            state: self.state,
            transitions: self.transitions,
            attempts: self.attempts,
            link,
        })
    }

    fn transition(&mut self, next: ConnectionState) {
        info!("connection: {:?} -> {:?}", self.state, next);
        self.transitions.push(next.clone());
        self.state = next;
    }

    fn next_candidate(&mut self) -> ConnectionState {
        match self.candidates.front() {
            Some(candidate) => ConnectionState::Connecting(candidate.ssid.clone()),
            None => ConnectionState::ApMode,
        }
    }

    fn attempt<R: Radio, D: FnMut(Duration)>(
        &mut self,
        radio: &mut R,
        networks: &BTreeMap<String, NetworkCredential>,
        ssid: &str,
        delay: &mut D,
    ) -> AttemptOutcome {
        let rssi = self.candidates.pop_front().map_or(0, |entry| entry.rssi);
        let password = networks
            .get(ssid)
            .map(|net| net.password.as_str())
            .unwrap_or_default();

        info!("trying to connect to `{ssid}` ({rssi} dBm)");
        let (outcome, polls) = match radio.connect(ssid, password) {
            Ok(()) => self.poll_link(radio, delay),
            Err(err) => {
                warn!("connect to `{ssid}` rejected: {err}");
                (AttemptOutcome::ConnectFailed, 0)
            }
        };
        info!("connect to `{ssid}`: {outcome:?} after {polls} polls");

        self.attempts.push(Attempt {
            ssid: ssid.to_string(),
            rssi,
            outcome,
            polls,
        });
        outcome
    }

    fn poll_link<R: Radio, D: FnMut(Duration)>(
        &self,
        radio: &mut R,
        delay: &mut D,
    ) -> (AttemptOutcome, u32) {
        for poll in 1..=self.policy.max_polls {
            delay(self.policy.poll_interval);
            let outcome = match radio.status() {
                LinkStatus::GotIp => AttemptOutcome::GotIp,
                LinkStatus::WrongPassword => AttemptOutcome::WrongPassword,
                LinkStatus::ConnectFailed => AttemptOutcome::ConnectFailed,
                LinkStatus::NoApFound => AttemptOutcome::NoApFound,
                LinkStatus::Idle | LinkStatus::Connecting => continue,
            };
            return (outcome, poll);
        }
        (AttemptOutcome::Timeout, self.policy.max_polls)
    }

    fn finish_connected<R: Radio, P: OutputPin>(
        &self,
        radio: &mut R,
        indicator: Option<&mut Indicator<P>>,
    ) -> LinkInfo {
        if let Err(err) = radio.disable_access_point() {
            warn!("failed to disable access point: {err}");
        }
        if let Some(indicator) = indicator {
            indicator.clear();
        }

        let ssid = self
            .attempts
            .last()
            .map(|attempt| attempt.ssid.clone())
            .unwrap_or_default();
        let ip = radio.station_info();
        match &ip {
            Some(ip) => info!(
                "connected to `{ssid}`: ip={} netmask={} gateway={} dns={:?}",
                ip.ip, ip.netmask, ip.gateway, ip.dns
            ),
            None => info!("connected to `{ssid}`"),
        }
        LinkInfo::Station { ssid, ip }
    }
}

/// Encrypted, saved networks, strongest first. Equal signal keeps scan order.
pub fn rank_candidates(
    scanned: Vec<ScanEntry>,
    networks: &BTreeMap<String, NetworkCredential>,
) -> Vec<ScanEntry> {
    let mut candidates: Vec<ScanEntry> = scanned
        .into_iter()
        .filter(|entry| entry.encrypted && networks.contains_key(&entry.ssid))
        .collect();
    candidates.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    candidates
}

fn start_access_point<R: Radio>(radio: &mut R) -> Result<LinkInfo, RadioError> {
    let config = AccessPointConfig::for_mac(radio.mac_address()?);
    radio.start_access_point(&config)?;
    info!(
        "access point `{}` up at {} (password: `{}`)",
        config.ssid, config.ip.ip, config.password
    );
    Ok(LinkInfo::AccessPoint {
        ssid: config.ssid,
        ip: config.ip,
    })
}
