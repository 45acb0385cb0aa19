//! Local configuration server.
//!
//! Runs only while the link is up. Besides a small JSON status page it
//! carries the provisioning endpoints and the push half of the firmware
//! update pipeline: `PUT /firmware_update` streams the image body straight
//! into the next OTA partition.

use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use std::sync::Arc;

use clock_core::release::{update_available, ReleaseCheckState};
use clock_core::update::{run_push_update, UpdateFailure, UpdateState};

use crate::ota::OtaManager;
use crate::version;
use super::NetContext;

/// Milliseconds granted to the UI to switch to its updating screen before
/// flash traffic starts starving it.
const UPDATE_UI_DELAY_MS: u32 = 1200;

pub struct WebServer {
    _server: EspHttpServer<'static>,
}

#[derive(serde::Deserialize)]
struct ConnectRequest {
    ssid: String,
    psk: String,
}

impl WebServer {
    pub fn start(ctx: Arc<NetContext>) -> Result<Self> {
        let mut server = EspHttpServer::new(&Configuration::default())?;

        // Status snapshot for the UI and for anyone poking the device
        let model = ctx.model.clone();
        server.fn_handler("/", Method::Get, move |req| {
            let snapshot = match model.lock() {
                Ok(model) => model.clone(),
                Err(_) => {
                    req.into_status_response(503)?;
                    return Ok(());
                }
            };
            let newer = matches!(
                snapshot.latest_release,
                ReleaseCheckState::Done(latest) if update_available(version::current(), latest)
            );
            let payload = serde_json::json!({
                "version": version::full_version(),
                "update_available": newer,
                "status": snapshot,
            });
            let mut response = req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "application/json")],
            )?;
            response.write_all(serde_json::to_string(&payload)?.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        // Provisioning: store credentials and reconnect
        let ctx_connect = ctx.clone();
        server.fn_handler("/wifi_connect", Method::Post, move |mut req| {
            let mut buf = vec![0; 256];
            let len = req.read(&mut buf)?;
            buf.truncate(len);
            let request: ConnectRequest = serde_json::from_slice(&buf)?;
            ctx_connect.request_connect(&request.ssid, &request.psk);
            req.into_ok_response()?;
            Ok::<(), anyhow::Error>(())
        })?;

        // Provisioning: ask for a fresh scan; results land in the status page
        let ctx_scan = ctx.clone();
        server.fn_handler("/wifi_scan", Method::Post, move |req| {
            ctx_scan.request_scan();
            req.into_ok_response()?;
            Ok::<(), anyhow::Error>(())
        })?;

        // Start a pull update from the last discovered release asset
        let ctx_pull = ctx.clone();
        server.fn_handler("/firmware_update/latest", Method::Post, move |req| {
            ctx_pull.request_update();
            req.into_ok_response()?;
            Ok::<(), anyhow::Error>(())
        })?;

        // PUT /firmware_update
        let ctx_push = ctx.clone();
        server.fn_handler("/firmware_update", Method::Put, move |mut req| {
            let content_len = req
                .header("Content-Length")
                .and_then(|v| v.parse::<usize>().ok());
            let Some(content_len) = content_len else {
                req.into_status_response(411)?;
                return Ok(());
            };

            // One attempt at a time; a new one may only start from an idle
            // or terminal state.
            {
                let Ok(mut model) = ctx_push.model.lock() else {
                    req.into_status_response(503)?;
                    return Ok(());
                };
                if !model.firmware_update.can_start() {
                    req.into_status_response(409)?;
                    return Ok(());
                }
                model.firmware_update = UpdateState::Updating;
            }

            log::info!("firmware update started, request size {content_len}");
            // Allow time for the application to display the update page
            FreeRtos::delay_ms(UPDATE_UI_DELAY_MS);

            let mut flash = OtaManager::new();
            let result = run_push_update(&mut flash, content_len, |buf| {
                req.read(buf).map_err(|e| e.0.code())
            });

            match result {
                Ok(()) => {
                    if let Ok(mut model) = ctx_push.model.lock() {
                        model.firmware_update = UpdateState::Success;
                    }
                    log::info!("update successful, reset the device to apply");
                    req.into_ok_response()?;
                }
                Err(failure) => {
                    if let Ok(mut model) = ctx_push.model.lock() {
                        model.firmware_update = UpdateState::Failure(failure);
                    }
                    log::error!("firmware update failed: {failure}");
                    let mut response = req.into_status_response(500)?;
                    response.write_all(failure_body(failure).as_bytes())?;
                }
            }
            Ok::<(), anyhow::Error>(())
        })?;

        Ok(Self { _server: server })
    }
}

/// Error body of the local update endpoint. `step` identifies the failed
/// stage, `code` is the raw driver error.
fn failure_body(failure: UpdateFailure) -> String {
    format!(
        r#"{{"desc":"OTA error","error":3,"step":{},"code":{}}}"#,
        failure.code.step(),
        failure.raw
    )
}
