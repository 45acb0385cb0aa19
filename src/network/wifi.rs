//! Radio glue: translates ESP-IDF WiFi/IP events into link machine events
//! and dispatches the machine's commands back to the driver.
//!
//! Events arrive on the system event loop task while the control loop polls
//! from the main task; the machine's mutex serializes both. Commands are
//! issued only after the lock is released.

use anyhow::Result;
use core::ffi::c_void;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::{
    esp, esp_event_base_t, esp_event_handler_register, esp_wifi_connect, esp_wifi_disconnect,
    esp_wifi_get_config, esp_wifi_scan_get_ap_records, esp_wifi_scan_start, esp_wifi_set_config,
    esp_wifi_start, esp_wifi_stop, ip_event_got_ip_t, ip_event_t_IP_EVENT_STA_GOT_IP,
    wifi_ap_record_t, wifi_config_t, wifi_event_sta_disconnected_t, wifi_event_t_WIFI_EVENT_SCAN_DONE,
    wifi_event_t_WIFI_EVENT_STA_CONNECTED, wifi_event_t_WIFI_EVENT_STA_DISCONNECTED,
    wifi_event_t_WIFI_EVENT_STA_START, wifi_event_t_WIFI_EVENT_STA_STOP, wifi_interface_t_WIFI_IF_STA,
    wifi_scan_config_t, wifi_scan_type_t_WIFI_SCAN_TYPE_ACTIVE, ESP_EVENT_ANY_ID, ESP_OK, IP_EVENT,
    WIFI_EVENT,
};
use std::sync::{Arc, Mutex};

use clock_core::link::{
    AccessPoint, Commands, Credentials, LinkEvent, Psk, RadioCommand, ScanList, Ssid,
    MAX_SCAN_RESULTS,
};
use clock_core::model::Model;

use crate::config::Config;
use super::NetContext;

/// Owns the WiFi driver and the shared context. Kept alive for the whole
/// process; the raw event handlers borrow the context through a pointer that
/// is valid as long as this exists.
pub struct ConnectivityManager {
    _wifi: EspWifi<'static>,
    _ctx: Arc<NetContext>,
}

impl ConnectivityManager {
    /// Bring the radio up in station mode. With saved credentials the
    /// started callback kicks off the first connection attempt.
    pub fn start(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        config: &Config,
        model: Arc<Mutex<Model>>,
    ) -> Result<(Self, Arc<NetContext>)> {
        let credentials = saved_credentials(config);
        let ctx = NetContext::new(credentials, model, nvs.clone());

        let mut wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;
        let client_config = if config.has_credentials() {
            ClientConfiguration {
                ssid: config
                    .wifi_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("invalid SSID '{}'", config.wifi_ssid))?,
                password: config
                    .wifi_password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("invalid passphrase"))?,
                auth_method: if config.wifi_password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ..Default::default()
            }
        } else {
            ClientConfiguration::default()
        };
        wifi.set_configuration(&Configuration::Client(client_config))?;

        register_event_handlers(&ctx)?;
        wifi.start()?;

        Ok((
            Self {
                _wifi: wifi,
                _ctx: ctx.clone(),
            },
            ctx,
        ))
    }
}

fn saved_credentials(config: &Config) -> Option<Credentials> {
    if !config.has_credentials() {
        log::info!("no saved network");
        return None;
    }
    let ssid = Ssid::try_from(config.wifi_ssid.as_str()).ok()?;
    let psk = Psk::try_from(config.wifi_password.as_str()).ok()?;
    Some(Credentials { ssid, psk })
}

fn register_event_handlers(ctx: &Arc<NetContext>) -> Result<()> {
    // The context outlives the handlers (it is never dropped), so a plain
    // pointer is enough for the callback argument.
    let arg = Arc::as_ptr(ctx) as *mut c_void;
    unsafe {
        esp!(esp_event_handler_register(
            WIFI_EVENT,
            ESP_EVENT_ANY_ID,
            Some(wifi_event_handler),
            arg,
        ))?;
        esp!(esp_event_handler_register(
            IP_EVENT,
            ip_event_t_IP_EVENT_STA_GOT_IP as i32,
            Some(ip_event_handler),
            arg,
        ))?;
    }
    Ok(())
}

unsafe extern "C" fn wifi_event_handler(
    arg: *mut c_void,
    _event_base: esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    let ctx = &*(arg as *const NetContext);
    match event_id as u32 {
        wifi_event_t_WIFI_EVENT_STA_START => {
            log::info!("STA started");
            deliver(ctx, LinkEvent::Started);
        }
        wifi_event_t_WIFI_EVENT_STA_STOP => {
            log::info!("STA stopped");
            deliver(ctx, LinkEvent::Stopped);
        }
        wifi_event_t_WIFI_EVENT_STA_CONNECTED => {
            log::info!("associated, waiting for address");
        }
        wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
            let reason = if event_data.is_null() {
                0
            } else {
                (*(event_data as *const wifi_event_sta_disconnected_t)).reason as u32
            };
            log::warn!("link down: {}", describe_reason(reason));
            deliver(ctx, LinkEvent::LinkDown);
        }
        wifi_event_t_WIFI_EVENT_SCAN_DONE => {
            let aps = fetch_scan_records();
            log::info!("wifi scan done, {} networks found", aps.len());
            deliver(ctx, LinkEvent::ScanDone { aps });
        }
        other => {
            log::debug!("unhandled WiFi event {other}");
        }
    }
}

unsafe extern "C" fn ip_event_handler(
    arg: *mut c_void,
    _event_base: esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    if event_id as u32 != ip_event_t_IP_EVENT_STA_GOT_IP || event_data.is_null() {
        return;
    }
    let ctx = &*(arg as *const NetContext);
    let event = &*(event_data as *const ip_event_got_ip_t);
    let ip = event.ip_info.ip.addr;
    log::info!(
        "got ip {}.{}.{}.{}",
        ip & 0xff,
        (ip >> 8) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 24) & 0xff
    );
    deliver(ctx, LinkEvent::LinkUp { ip });
}

/// Feed one event through the machine and act on the outcome. The lock is
/// dropped before any driver call.
fn deliver(ctx: &NetContext, event: LinkEvent) {
    let commands = match ctx.link.lock() {
        Ok(mut link) => link.handle(event),
        Err(_) => {
            log::error!("link state lock poisoned, dropping event");
            return;
        }
    };
    issue(ctx, &commands);
    ctx.sync_server();
}

/// Dispatch machine commands to the driver.
pub(crate) fn issue(ctx: &NetContext, commands: &Commands) {
    for command in commands {
        let err = match command {
            RadioCommand::Connect => unsafe { esp_wifi_connect() },
            RadioCommand::Disconnect => unsafe { esp_wifi_disconnect() },
            RadioCommand::Stop => unsafe { esp_wifi_stop() },
            RadioCommand::Start => unsafe { esp_wifi_start() },
            RadioCommand::Scan => {
                let err = start_scan();
                if err != ESP_OK {
                    // Radio busy; retried once the link settles.
                    log::info!("temporarily unable to scan (0x{err:x})");
                    if let Ok(mut link) = ctx.link.lock() {
                        link.scan_rejected();
                    }
                }
                continue;
            }
        };
        if err != ESP_OK {
            log::warn!("radio command {command:?} failed (0x{err:x})");
        }
    }
}

fn start_scan() -> i32 {
    unsafe {
        let mut config: wifi_scan_config_t = core::mem::zeroed();
        config.scan_type = wifi_scan_type_t_WIFI_SCAN_TYPE_ACTIVE;
        esp_wifi_scan_start(&config, false)
    }
}

/// Copy the driver's scan buffer, bounded to capacity; extras are discarded.
unsafe fn fetch_scan_records() -> ScanList {
    let mut records: [wifi_ap_record_t; MAX_SCAN_RESULTS] = core::mem::zeroed();
    let mut count = MAX_SCAN_RESULTS as u16;
    let mut list = ScanList::new();
    let err = esp_wifi_scan_get_ap_records(&mut count, records.as_mut_ptr());
    if err != ESP_OK {
        log::warn!("esp_wifi_scan_get_ap_records failed (0x{err:x})");
        return list;
    }
    for record in records.iter().take(count as usize) {
        let len = record
            .ssid
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(record.ssid.len());
        let ssid = core::str::from_utf8(&record.ssid[..len]).unwrap_or_default();
        let ap = AccessPoint {
            ssid: Ssid::try_from(ssid).unwrap_or_default(),
            rssi: record.rssi,
        };
        if list.push(ap).is_err() {
            break;
        }
    }
    list
}

/// Write new station credentials into the driver configuration, preserving
/// the remaining fields.
pub(crate) fn apply_sta_config(ssid: &str, psk: &str) {
    unsafe {
        let mut config: wifi_config_t = core::mem::zeroed();
        let err = esp_wifi_get_config(wifi_interface_t_WIFI_IF_STA, &mut config);
        if err != ESP_OK {
            log::warn!("esp_wifi_get_config failed (0x{err:x})");
        }
        copy_padded(&mut config.sta.ssid, ssid.as_bytes());
        copy_padded(&mut config.sta.password, psk.as_bytes());
        let err = esp_wifi_set_config(wifi_interface_t_WIFI_IF_STA, &mut config);
        if err != ESP_OK {
            log::warn!("esp_wifi_set_config failed (0x{err:x})");
        }
    }
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    dst.fill(0);
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src[..n]);
}

fn describe_reason(reason: u32) -> &'static str {
    use esp_idf_sys::{
        wifi_err_reason_t_WIFI_REASON_4WAY_HANDSHAKE_TIMEOUT, wifi_err_reason_t_WIFI_REASON_ASSOC_FAIL,
        wifi_err_reason_t_WIFI_REASON_AUTH_EXPIRE, wifi_err_reason_t_WIFI_REASON_AUTH_FAIL,
        wifi_err_reason_t_WIFI_REASON_BEACON_TIMEOUT,
        wifi_err_reason_t_WIFI_REASON_HANDSHAKE_TIMEOUT, wifi_err_reason_t_WIFI_REASON_NO_AP_FOUND,
    };
    match reason {
        wifi_err_reason_t_WIFI_REASON_AUTH_EXPIRE
        | wifi_err_reason_t_WIFI_REASON_4WAY_HANDSHAKE_TIMEOUT
        | wifi_err_reason_t_WIFI_REASON_BEACON_TIMEOUT
        | wifi_err_reason_t_WIFI_REASON_AUTH_FAIL
        | wifi_err_reason_t_WIFI_REASON_ASSOC_FAIL
        | wifi_err_reason_t_WIFI_REASON_HANDSHAKE_TIMEOUT => "authentication failed",
        wifi_err_reason_t_WIFI_REASON_NO_AP_FOUND => "access point not found",
        _ => "connection lost",
    }
}
