//! Wireless link state machine.
//!
//! `LinkMachine` holds the mutex-guarded link record (state, SSID, IP, scan
//! results) and converts driver events into state transitions plus the radio
//! commands the firmware layer must issue. The machine itself never talks to
//! the radio: callbacks feed it `LinkEvent`s, the control loop feeds it
//! requests, and both dispatch the returned `RadioCommand`s after releasing
//! the lock.

use heapless::{String as BoundedString, Vec as BoundedVec};
use serde::Serialize;

/// Scan results are bounded; extra access points are discarded.
pub const MAX_SCAN_RESULTS: usize = 16;

pub const SSID_MAX_LEN: usize = 32;
pub const PSK_MAX_LEN: usize = 64;

pub type Ssid = BoundedString<SSID_MAX_LEN>;
pub type Psk = BoundedString<PSK_MAX_LEN>;
pub type ScanList = BoundedVec<AccessPoint, MAX_SCAN_RESULTS>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One entry of a completed scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessPoint {
    pub ssid: Ssid,
    /// Signal strength in dBm.
    pub rssi: i8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: Ssid,
    pub psk: Psk,
}

/// Driver-boundary events, one enum tag per callback the radio delivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// Radio started in station mode.
    Started,
    /// Radio stopped.
    Stopped,
    /// Association complete and an address was assigned.
    LinkUp { ip: u32 },
    /// Association lost or a connection attempt failed.
    LinkDown,
    /// An access point scan finished.
    ScanDone { aps: ScanList },
}

/// Commands the firmware layer issues back to the radio driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioCommand {
    Start,
    Stop,
    Connect,
    Disconnect,
    Scan,
}

/// At most two commands result from any single event.
pub type Commands = BoundedVec<RadioCommand, 2>;

/// Snapshot of the link record, copied into the model each tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WifiSnapshot {
    pub state: LinkState,
    /// Empty unless connecting or connected.
    pub ssid: Ssid,
    /// Zero unless connected.
    pub ip: u32,
}

#[derive(Debug, Default)]
pub struct LinkMachine {
    state: LinkState,
    ip: u32,
    credentials: Option<Credentials>,
    /// A connect request arrived mid-attempt; restart the radio once stopped.
    connect_after_stop: bool,
    /// A scan request arrived while a connection attempt was in flight.
    deferred_scan: bool,
    /// A scan command has been issued and no result has arrived yet.
    scanning: bool,
    scan_results: ScanList,
    /// Completed-scan signal, consumed once by `take_scan_results`.
    scan_ready: bool,
}

impl LinkMachine {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// True while a requested scan is waiting for the link to settle.
    pub fn deferred_scan_pending(&self) -> bool {
        self.deferred_scan
    }

    pub fn snapshot(&self) -> WifiSnapshot {
        let ssid = match (self.state, &self.credentials) {
            (LinkState::Disconnected, _) | (_, None) => Ssid::new(),
            (_, Some(creds)) => creds.ssid.clone(),
        };
        WifiSnapshot {
            state: self.state,
            ssid,
            ip: if self.state == LinkState::Connected {
                self.ip
            } else {
                0
            },
        }
    }

    /// Feed one driver event, returning the commands to issue.
    pub fn handle(&mut self, event: LinkEvent) -> Commands {
        let mut out = Commands::new();
        match event {
            LinkEvent::Started => {
                if self.credentials.is_some() {
                    self.state = LinkState::Connecting;
                    push(&mut out, RadioCommand::Connect);
                }
            }
            LinkEvent::Stopped => {
                self.state = LinkState::Disconnected;
                self.ip = 0;
                if self.connect_after_stop {
                    self.connect_after_stop = false;
                    push(&mut out, RadioCommand::Start);
                }
            }
            LinkEvent::LinkUp { ip } => {
                self.state = LinkState::Connected;
                self.ip = ip;
                if self.deferred_scan {
                    self.deferred_scan = false;
                    self.scanning = true;
                    push(&mut out, RadioCommand::Scan);
                }
            }
            LinkEvent::LinkDown => {
                self.state = LinkState::Disconnected;
                self.ip = 0;
                if self.connect_after_stop {
                    // Mid stop sequence; the Stopped event restarts us.
                } else if self.deferred_scan {
                    // Put connection efforts aside: run the pending scan,
                    // keeping the flag so its completion resumes connecting.
                    self.scanning = true;
                    push(&mut out, RadioCommand::Scan);
                } else {
                    // Retry indefinitely, no backoff.
                    self.state = LinkState::Connecting;
                    push(&mut out, RadioCommand::Connect);
                }
            }
            LinkEvent::ScanDone { aps } => {
                self.scan_results = aps;
                self.scan_ready = true;
                self.scanning = false;
                if self.deferred_scan {
                    self.deferred_scan = false;
                    if self.state == LinkState::Disconnected {
                        self.state = LinkState::Connecting;
                        push(&mut out, RadioCommand::Connect);
                    }
                }
            }
        }
        out
    }

    /// Store new credentials and (re)connect with them.
    pub fn request_connect(&mut self, ssid: Ssid, psk: Psk) -> Commands {
        self.credentials = Some(Credentials { ssid, psk });
        let mut out = Commands::new();
        match self.state {
            LinkState::Disconnected => {
                self.state = LinkState::Connecting;
                push(&mut out, RadioCommand::Connect);
            }
            LinkState::Connecting => {
                self.connect_after_stop = true;
                push(&mut out, RadioCommand::Stop);
            }
            LinkState::Connected => {
                // The disconnect callback performs the actual reconnect.
                push(&mut out, RadioCommand::Disconnect);
            }
        }
        out
    }

    /// Request an access point scan; deferred while a connection attempt is
    /// in flight.
    pub fn request_scan(&mut self) -> Commands {
        let mut out = Commands::new();
        if self.scanning || self.deferred_scan {
            return out;
        }
        if self.state == LinkState::Connecting {
            self.deferred_scan = true;
        } else {
            self.scanning = true;
            push(&mut out, RadioCommand::Scan);
        }
        out
    }

    /// The driver refused to start the scan (radio busy); retry once the
    /// link settles.
    pub fn scan_rejected(&mut self) {
        self.scanning = false;
        self.deferred_scan = true;
    }

    /// Retry a deferred scan that no link event has unblocked.
    pub fn retry_deferred_scan(&mut self) -> Commands {
        let mut out = Commands::new();
        if self.deferred_scan && self.state != LinkState::Connecting && !self.scanning {
            self.deferred_scan = false;
            self.scanning = true;
            push(&mut out, RadioCommand::Scan);
        }
        out
    }

    /// Idempotent drain of the completed-scan signal: returns the results of
    /// the last scan exactly once.
    pub fn take_scan_results(&mut self) -> Option<ScanList> {
        if self.scan_ready {
            self.scan_ready = false;
            Some(self.scan_results.clone())
        } else {
            None
        }
    }
}

fn push(out: &mut Commands, cmd: RadioCommand) {
    // Capacity is sized for the worst transition; overflow is a logic bug.
    let overflow = out.push(cmd).is_err();
    debug_assert!(!overflow);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ssid(s: &str) -> Ssid {
        Ssid::try_from(s).unwrap()
    }

    fn machine_with_creds() -> LinkMachine {
        LinkMachine::new(Some(Credentials {
            ssid: ssid("clockwork"),
            psk: Psk::try_from("hunter22").unwrap(),
        }))
    }

    fn scan_list(names: &[&str]) -> ScanList {
        let mut aps = ScanList::new();
        for (i, name) in names.iter().enumerate() {
            let _ = aps.push(AccessPoint {
                ssid: ssid(name),
                rssi: -40 - i as i8,
            });
        }
        aps
    }

    #[test]
    fn started_with_credentials_connects() {
        let mut m = machine_with_creds();
        let cmds = m.handle(LinkEvent::Started);
        assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
        assert_eq!(m.state(), LinkState::Connecting);
    }

    #[test]
    fn started_without_credentials_stays_down() {
        let mut m = LinkMachine::new(None);
        assert!(m.handle(LinkEvent::Started).is_empty());
        assert_eq!(m.state(), LinkState::Disconnected);
    }

    #[test]
    fn link_down_always_retries() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        for _ in 0..10 {
            let cmds = m.handle(LinkEvent::LinkDown);
            assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
            assert_eq!(m.state(), LinkState::Connecting);
        }
    }

    #[test]
    fn snapshot_reports_ip_only_when_connected() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        assert_eq!(m.snapshot().ip, 0);
        m.handle(LinkEvent::LinkUp { ip: 0x0100_a8c0 });
        let snap = m.snapshot();
        assert_eq!(snap.state, LinkState::Connected);
        assert_eq!(snap.ip, 0x0100_a8c0);
        assert_eq!(snap.ssid.as_str(), "clockwork");
        m.handle(LinkEvent::LinkDown);
        assert_eq!(m.snapshot().ip, 0);
    }

    #[test]
    fn scan_while_connecting_is_deferred_until_link_up() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        // Never starts immediately while a connection attempt is in flight.
        assert!(m.request_scan().is_empty());
        assert!(m.deferred_scan_pending());
        // Repeated requests do not queue further scans.
        assert!(m.request_scan().is_empty());
        let cmds = m.handle(LinkEvent::LinkUp { ip: 1 });
        assert_eq!(cmds.as_slice(), &[RadioCommand::Scan]);
        assert!(!m.deferred_scan_pending());
    }

    #[test]
    fn scan_while_connecting_runs_after_failure_then_resumes_connecting() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        assert!(m.request_scan().is_empty());
        // The failed attempt yields to the pending scan instead of retrying.
        let cmds = m.handle(LinkEvent::LinkDown);
        assert_eq!(cmds.as_slice(), &[RadioCommand::Scan]);
        assert_eq!(m.state(), LinkState::Disconnected);
        // Scan completion resumes the reconnect loop.
        let cmds = m.handle(LinkEvent::ScanDone {
            aps: scan_list(&["a", "b"]),
        });
        assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
        assert_eq!(m.state(), LinkState::Connecting);
    }

    #[test]
    fn scan_results_drain_exactly_once() {
        let mut m = machine_with_creds();
        let cmds = m.request_scan();
        assert_eq!(cmds.as_slice(), &[RadioCommand::Scan]);
        assert!(m.take_scan_results().is_none());
        m.handle(LinkEvent::ScanDone {
            aps: scan_list(&["one", "two", "three"]),
        });
        let drained = m.take_scan_results().unwrap();
        assert_eq!(drained.len(), 3);
        assert!(m.take_scan_results().is_none());
    }

    #[test]
    fn rejected_scan_retries_when_link_settles() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        m.handle(LinkEvent::LinkUp { ip: 7 });
        assert_eq!(m.request_scan().as_slice(), &[RadioCommand::Scan]);
        m.scan_rejected();
        assert!(m.deferred_scan_pending());
        let cmds = m.retry_deferred_scan();
        assert_eq!(cmds.as_slice(), &[RadioCommand::Scan]);
        assert!(!m.deferred_scan_pending());
    }

    #[test]
    fn new_credentials_while_connecting_stop_then_restart() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        let cmds = m.request_connect(ssid("other"), Psk::try_from("pw").unwrap());
        assert_eq!(cmds.as_slice(), &[RadioCommand::Stop]);
        // The disconnect that precedes the stop must not trigger a retry.
        assert!(m.handle(LinkEvent::LinkDown).is_empty());
        let cmds = m.handle(LinkEvent::Stopped);
        assert_eq!(cmds.as_slice(), &[RadioCommand::Start]);
        let cmds = m.handle(LinkEvent::Started);
        assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
        assert_eq!(m.credentials().unwrap().ssid.as_str(), "other");
    }

    #[test]
    fn new_credentials_while_connected_disconnect_first() {
        let mut m = machine_with_creds();
        m.handle(LinkEvent::Started);
        m.handle(LinkEvent::LinkUp { ip: 1 });
        let cmds = m.request_connect(ssid("other"), Psk::try_from("pw").unwrap());
        assert_eq!(cmds.as_slice(), &[RadioCommand::Disconnect]);
        // The disconnect callback performs the reconnect with new credentials.
        let cmds = m.handle(LinkEvent::LinkDown);
        assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
        assert_eq!(m.snapshot().ssid.as_str(), "other");
    }

    // Stimuli a hostile radio can produce between our own requests.
    #[derive(Clone, Debug)]
    enum Stimulus {
        Down,
        Up,
        ScanDone,
        RequestScan,
    }

    fn stimulus() -> impl Strategy<Value = Stimulus> {
        prop_oneof![
            Just(Stimulus::Down),
            Just(Stimulus::Up),
            Just(Stimulus::ScanDone),
            Just(Stimulus::RequestScan),
        ]
    }

    proptest! {
        // Reconnect is never permanently abandoned: whatever happened
        // before, a link-down either retries the connection immediately or
        // runs a deferred scan whose completion retries it.
        #[test]
        fn link_down_eventually_reconnects(seq in proptest::collection::vec(stimulus(), 0..40)) {
            let mut m = machine_with_creds();
            m.handle(LinkEvent::Started);
            for s in seq {
                match s {
                    Stimulus::Down => { m.handle(LinkEvent::LinkDown); }
                    Stimulus::Up => { m.handle(LinkEvent::LinkUp { ip: 1 }); }
                    Stimulus::ScanDone => { m.handle(LinkEvent::ScanDone { aps: ScanList::new() }); }
                    Stimulus::RequestScan => { m.request_scan(); }
                }
            }
            let cmds = m.handle(LinkEvent::LinkDown);
            if cmds.as_slice() == [RadioCommand::Scan] {
                let cmds = m.handle(LinkEvent::ScanDone { aps: ScanList::new() });
                prop_assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
            } else {
                prop_assert_eq!(cmds.as_slice(), &[RadioCommand::Connect]);
            }
            prop_assert_eq!(m.state(), LinkState::Connecting);
        }
    }
}
