//! Pull update path: stream a firmware asset over HTTPS straight into the
//! flash session, one bounded transfer step per control tick.
//!
//! The client runs in async mode; each `advance` is one
//! `esp_http_client_perform` call, and whatever the data callback received
//! during it has already been written to flash when the call returns.

use core::ffi::{c_char, c_void};
use std::ffi::CString;

use esp_idf_sys::{
    esp_crt_bundle_attach, esp_http_client_cleanup, esp_http_client_config_t,
    esp_http_client_event_id_t_HTTP_EVENT_ON_DATA, esp_http_client_event_t,
    esp_http_client_get_content_length, esp_http_client_handle_t, esp_http_client_init,
    esp_http_client_method_t_HTTP_METHOD_GET, esp_http_client_perform,
    esp_http_client_set_header, esp_err_t, ESP_ERR_HTTP_EAGAIN, ESP_FAIL, ESP_OK,
};

use clock_core::update::{
    FirmwareSource, FlashTarget, SourceProgress, UpdateFailure, UpdateFailureCode,
};

const HEADER_ACCEPT: &[u8] = b"Accept\0";
const ACCEPT_OCTET_STREAM: &[u8] = b"application/octet-stream\0";
const HEADER_API_VERSION: &[u8] = b"X-GitHub-Api-Version\0";
const API_VERSION: &[u8] = b"2022-11-28\0";

/// Shared with the data callback through `user_data`. The flash pointer is
/// only set for the duration of one `perform` call.
struct SinkState {
    flash: Option<*mut dyn FlashTarget>,
    failure: Option<UpdateFailure>,
    received: usize,
}

pub struct HttpSource {
    client: esp_http_client_handle_t,
    sink: Box<SinkState>,
    _url: CString,
}

impl HttpSource {
    /// Open a streaming GET against the discovered asset URL. No bytes move
    /// until the first `advance`.
    pub fn open(url: &str) -> Result<Self, UpdateFailure> {
        log::info!("starting HTTPS OTA for {url}");
        let c_url =
            CString::new(url).map_err(|_| UpdateFailure::new(UpdateFailureCode::Receive, 0))?;
        let mut sink = Box::new(SinkState {
            flash: None,
            failure: None,
            received: 0,
        });

        let client = unsafe {
            let mut config: esp_http_client_config_t = core::mem::zeroed();
            config.url = c_url.as_ptr();
            config.method = esp_http_client_method_t_HTTP_METHOD_GET;
            config.event_handler = Some(write_chunk_cb);
            config.user_data = sink.as_mut() as *mut SinkState as *mut c_void;
            config.is_async = true;
            config.crt_bundle_attach = Some(esp_crt_bundle_attach);
            config.buffer_size_tx = 512 + 256;
            esp_http_client_init(&config)
        };
        if client.is_null() {
            return Err(UpdateFailure::new(UpdateFailureCode::Receive, 0));
        }
        unsafe {
            esp_http_client_set_header(
                client,
                HEADER_ACCEPT.as_ptr() as *const c_char,
                ACCEPT_OCTET_STREAM.as_ptr() as *const c_char,
            );
            esp_http_client_set_header(
                client,
                HEADER_API_VERSION.as_ptr() as *const c_char,
                API_VERSION.as_ptr() as *const c_char,
            );
        }

        Ok(Self {
            client,
            sink,
            _url: c_url,
        })
    }
}

impl FirmwareSource for HttpSource {
    fn advance(&mut self, flash: &mut dyn FlashTarget) -> Result<SourceProgress, UpdateFailure> {
        self.sink.flash = Some(flash as *mut dyn FlashTarget);
        let err = unsafe { esp_http_client_perform(self.client) };
        self.sink.flash = None;

        if let Some(failure) = self.sink.failure.take() {
            return Err(failure);
        }
        if err == ESP_ERR_HTTP_EAGAIN as i32 {
            return Ok(SourceProgress::Pending);
        }
        if err != ESP_OK {
            log::error!("firmware transfer failed (0x{err:x})");
            return Err(UpdateFailure::new(UpdateFailureCode::Receive, err));
        }

        let content_length = unsafe { esp_http_client_get_content_length(self.client) };
        let all_received = content_length < 0 || self.sink.received as i64 == content_length;
        log::info!(
            "firmware transfer complete, {} bytes received",
            self.sink.received
        );
        Ok(SourceProgress::Complete { all_received })
    }
}

impl Drop for HttpSource {
    fn drop(&mut self) {
        unsafe {
            esp_http_client_cleanup(self.client);
        }
    }
}

unsafe extern "C" fn write_chunk_cb(evt: *mut esp_http_client_event_t) -> esp_err_t {
    let evt = &*evt;
    if evt.event_id != esp_http_client_event_id_t_HTTP_EVENT_ON_DATA || evt.user_data.is_null() {
        return ESP_OK;
    }
    let sink = &mut *(evt.user_data as *mut SinkState);
    if sink.failure.is_some() {
        return ESP_FAIL;
    }
    let Some(flash_ptr) = sink.flash else {
        return ESP_OK;
    };
    let chunk = core::slice::from_raw_parts(evt.data as *const u8, evt.data_len as usize);
    match (*flash_ptr).write(chunk) {
        Ok(()) => {
            sink.received += chunk.len();
            ESP_OK
        }
        Err(failure) => {
            sink.failure = Some(failure);
            ESP_FAIL
        }
    }
}
