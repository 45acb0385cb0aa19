pub mod web_server;
pub mod wifi;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use esp_idf_svc::nvs::EspDefaultNvsPartition;

use clock_core::link::{Credentials, LinkMachine, LinkState, Psk, Ssid};
use clock_core::model::Model;

use crate::config::Config;
use self::web_server::WebServer;

/// Everything the connectivity side shares between the driver-callback
/// context and the control loop. One lock guards the whole link record so a
/// reader never observes interleaved {state, ssid, ip}. Constructed once and
/// kept alive for the process lifetime.
pub struct NetContext {
    pub(crate) link: Mutex<LinkMachine>,
    pub(crate) model: Arc<Mutex<Model>>,
    server: Mutex<Option<WebServer>>,
    /// "start update" request latched for the control loop.
    update_requested: AtomicBool,
    nvs: EspDefaultNvsPartition,
    weak_self: Weak<NetContext>,
}

impl NetContext {
    pub fn new(
        credentials: Option<Credentials>,
        model: Arc<Mutex<Model>>,
        nvs: EspDefaultNvsPartition,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            link: Mutex::new(LinkMachine::new(credentials)),
            model,
            server: Mutex::new(None),
            update_requested: AtomicBool::new(false),
            nvs,
            weak_self: weak.clone(),
        })
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// Store new credentials and (re)connect with them. Called from the
    /// provisioning boundary; the machine decides whether this is a direct
    /// connect, a stop-then-restart, or a disconnect-then-reconnect.
    pub fn request_connect(&self, ssid: &str, psk: &str) {
        let Ok(ssid_bounded) = Ssid::try_from(ssid) else {
            log::warn!("rejecting connect request, SSID too long");
            return;
        };
        let Ok(psk_bounded) = Psk::try_from(psk) else {
            log::warn!("rejecting connect request, passphrase too long");
            return;
        };
        log::info!("connect requested for '{ssid}'");

        let config = Config {
            wifi_ssid: ssid.to_string(),
            wifi_password: psk.to_string(),
        };
        if let Err(e) = config.save(self.nvs.clone()) {
            log::warn!("failed to persist credentials: {e}");
        }
        wifi::apply_sta_config(ssid, psk);

        let commands = match self.link.lock() {
            Ok(mut link) => link.request_connect(ssid_bounded, psk_bounded),
            Err(_) => return,
        };
        wifi::issue(self, &commands);
    }

    /// Ask for an access point scan; deferred while a connection attempt is
    /// in flight.
    pub fn request_scan(&self) {
        if let Ok(mut model) = self.model.lock() {
            model.scanning = true;
        }
        let commands = match self.link.lock() {
            Ok(mut link) => link.request_scan(),
            Err(_) => return,
        };
        wifi::issue(self, &commands);
    }

    /// Latch a "start update" request for the next control tick.
    pub fn request_update(&self) {
        self.update_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_update_request(&self) -> bool {
        self.update_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn deferred_scan_pending(&self) -> bool {
        self.link
            .lock()
            .map(|link| link.deferred_scan_pending())
            .unwrap_or(false)
    }

    /// Backstop for a deferred scan no link event unblocked.
    pub(crate) fn retry_deferred_scan(&self) {
        let commands = match self.link.lock() {
            Ok(mut link) => link.retry_deferred_scan(),
            Err(_) => return,
        };
        wifi::issue(self, &commands);
    }

    /// Keep the configuration server's lifetime in step with the link: it
    /// listens while connected and is torn down otherwise.
    pub(crate) fn sync_server(&self) {
        let connected = self
            .link
            .lock()
            .map(|link| link.state() == LinkState::Connected)
            .unwrap_or(false);

        let Ok(mut slot) = self.server.lock() else {
            return;
        };
        if connected && slot.is_none() {
            let Some(ctx) = self.arc() else { return };
            match WebServer::start(ctx) {
                Ok(server) => {
                    log::info!("configuration server started");
                    *slot = Some(server);
                }
                Err(e) => log::warn!("error starting configuration server: {e}"),
            }
        } else if !connected && slot.is_some() {
            log::info!("configuration server stopped");
            *slot = None;
        }
    }
}
