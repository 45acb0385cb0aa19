//! Release checker: one non-blocking GET against the release endpoint,
//! advanced each control tick until the body is in, then a minimal scan for
//! the version tag and the first asset's download URL.

use core::ffi::{c_char, c_void};
use std::sync::{Arc, Mutex};

use esp_idf_sys::{
    esp_crt_bundle_attach, esp_http_client_cleanup, esp_http_client_config_t,
    esp_http_client_event_id_t_HTTP_EVENT_ON_DATA, esp_http_client_event_t,
    esp_http_client_get_status_code, esp_http_client_handle_t, esp_http_client_init,
    esp_http_client_method_t_HTTP_METHOD_GET, esp_http_client_perform,
    esp_http_client_set_header, esp_err_t, ESP_ERR_HTTP_EAGAIN, ESP_OK,
};

use clock_core::model::Model;
use clock_core::release::{extract_release, ReleaseCheckState, Version};

const RELEASE_ENDPOINT: &[u8] =
    b"https://api.github.com/repos/maldus512/esp32-clock/releases/latest\0";
const HEADER_ACCEPT: &[u8] = b"Accept\0";
const ACCEPT_GITHUB_JSON: &[u8] = b"application/vnd.github+json\0";
const HEADER_API_VERSION: &[u8] = b"X-GitHub-Api-Version\0";
const API_VERSION: &[u8] = b"2022-11-28\0";

/// Response body accumulated by the data callback; boxed so its address
/// stays stable while the checker moves.
struct ResponseBody {
    data: Vec<u8>,
}

pub struct ReleaseChecker {
    client: esp_http_client_handle_t,
    body: Box<ResponseBody>,
    asset_url: Option<String>,
}

impl ReleaseChecker {
    pub fn new() -> Self {
        Self {
            client: core::ptr::null_mut(),
            body: Box::new(ResponseBody { data: Vec::new() }),
            asset_url: None,
        }
    }

    pub fn in_flight(&self) -> bool {
        !self.client.is_null()
    }

    /// Download URL of the last successfully checked release.
    pub fn asset_url(&self) -> Option<&str> {
        self.asset_url.as_deref()
    }

    /// Issue the request; a no-op while one is already in flight.
    pub fn start(&mut self, model: &Arc<Mutex<Model>>) {
        if self.in_flight() {
            return;
        }
        log::info!("requesting latest release");
        self.body.data.clear();

        let client = unsafe {
            let mut config: esp_http_client_config_t = core::mem::zeroed();
            config.url = RELEASE_ENDPOINT.as_ptr() as *const c_char;
            config.method = esp_http_client_method_t_HTTP_METHOD_GET;
            config.event_handler = Some(collect_body_cb);
            config.user_data = self.body.as_mut() as *mut ResponseBody as *mut c_void;
            config.is_async = true;
            config.crt_bundle_attach = Some(esp_crt_bundle_attach);
            esp_http_client_init(&config)
        };
        if client.is_null() {
            log::error!("failed to set up release request");
            set_state(model, ReleaseCheckState::Error);
            return;
        }
        unsafe {
            esp_http_client_set_header(
                client,
                HEADER_ACCEPT.as_ptr() as *const c_char,
                ACCEPT_GITHUB_JSON.as_ptr() as *const c_char,
            );
            esp_http_client_set_header(
                client,
                HEADER_API_VERSION.as_ptr() as *const c_char,
                API_VERSION.as_ptr() as *const c_char,
            );
        }
        self.client = client;
        set_state(model, ReleaseCheckState::Waiting);
    }

    /// Advance the transfer by one bounded step; true when it reached a
    /// terminal state this tick.
    pub fn poll(&mut self, model: &Arc<Mutex<Model>>) -> bool {
        if !self.in_flight() {
            return false;
        }
        let err = unsafe { esp_http_client_perform(self.client) };
        if err == ESP_ERR_HTTP_EAGAIN as i32 {
            return false;
        }

        let state = if err == ESP_OK {
            let status = unsafe { esp_http_client_get_status_code(self.client) };
            log::info!(
                "release endpoint returned status {status}, {} bytes",
                self.body.data.len()
            );
            match self.parse_response() {
                Some(version) => ReleaseCheckState::Done(version),
                None => ReleaseCheckState::Error,
            }
        } else {
            log::error!("release request failed (0x{err:x})");
            ReleaseCheckState::Error
        };

        self.cleanup();
        if let ReleaseCheckState::Done(version) = state {
            log::info!("latest published release is {version}");
        }
        set_state(model, state);
        true
    }

    fn parse_response(&mut self) -> Option<Version> {
        let body = core::str::from_utf8(&self.body.data).ok()?;
        let info = extract_release(body)?;
        let version = Version::parse(&info.name)?;
        self.asset_url = Some(info.url);
        Some(version)
    }

    fn cleanup(&mut self) {
        unsafe {
            esp_http_client_cleanup(self.client);
        }
        self.client = core::ptr::null_mut();
        self.body.data.clear();
    }
}

impl Drop for ReleaseChecker {
    fn drop(&mut self) {
        if self.in_flight() {
            self.cleanup();
        }
    }
}

fn set_state(model: &Arc<Mutex<Model>>, state: ReleaseCheckState) {
    if let Ok(mut model) = model.lock() {
        model.latest_release = state;
    }
}

unsafe extern "C" fn collect_body_cb(evt: *mut esp_http_client_event_t) -> esp_err_t {
    let evt = &*evt;
    if evt.event_id == esp_http_client_event_id_t_HTTP_EVENT_ON_DATA && !evt.user_data.is_null() {
        let body = &mut *(evt.user_data as *mut ResponseBody);
        let chunk = core::slice::from_raw_parts(evt.data as *const u8, evt.data_len as usize);
        body.data.extend_from_slice(chunk);
    }
    ESP_OK
}
