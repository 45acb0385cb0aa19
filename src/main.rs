use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::*;
use esp_idf_svc::{eventloop::EspSystemEventLoop, log::EspLogger, nvs::EspDefaultNvsPartition};
use esp_idf_sys as _; // Binstart
use std::sync::{Arc, Mutex};

use log::info;

// Generate ESP-IDF app descriptor so OTA images identify themselves
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod controller;
mod network;
mod ota;
mod release;
mod version;

use clock_core::model::Model;

use crate::controller::{Controller, CONTROL_TICK_MS};
use crate::network::wifi::ConnectivityManager;

fn main() -> Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("clock firmware {} booting", version::full_version());
    info!("free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let config = config::load_or_default(nvs.clone())?;
    let model = Arc::new(Mutex::new(Model::default()));

    // The manager owns the radio; events flow through the shared context
    // from here on.
    let (_connectivity, ctx) =
        ConnectivityManager::start(peripherals.modem, sysloop, nvs, &config, model.clone())?;
    let mut controller = Controller::new(ctx, model);

    info!("begin main loop");
    loop {
        controller.manage();
        FreeRtos::delay_ms(CONTROL_TICK_MS);
    }
}
