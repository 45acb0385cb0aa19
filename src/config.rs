use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use serde::{Deserialize, Serialize};

const CONFIG_NAMESPACE: &str = "clock";
const CONFIG_KEY: &str = "config";

/// Persisted network credentials. Display and alarm settings have their own
/// persistence path and never pass through here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub wifi_ssid: String,
    pub wifi_password: String,
}

impl Default for Config {
    fn default() -> Self {
        // Compiled-in fallback from wifi_config.h via build.rs; empty means
        // the device starts unprovisioned and waits for a connect request.
        Self {
            wifi_ssid: env!("WIFI_SSID").to_string(),
            wifi_password: env!("WIFI_PASSWORD").to_string(),
        }
    }
}

impl Config {
    pub fn has_credentials(&self) -> bool {
        !self.wifi_ssid.is_empty()
    }

    pub fn save(&self, partition: EspDefaultNvsPartition) -> Result<()> {
        let mut nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
        let json = serde_json::to_vec(self)?;
        nvs.set_blob(CONFIG_KEY, &json)?;
        log::info!("configuration saved to NVS");
        Ok(())
    }
}

pub fn load_or_default(partition: EspDefaultNvsPartition) -> Result<Config> {
    match load(partition) {
        Ok(config) => {
            log::info!("loaded configuration from NVS, SSID '{}'", config.wifi_ssid);
            Ok(config)
        }
        Err(e) => {
            log::warn!("no stored configuration ({e}), using defaults");
            Ok(Config::default())
        }
    }
}

fn load(partition: EspDefaultNvsPartition) -> Result<Config> {
    let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
    let mut buf = vec![0u8; 512];
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("config not found in NVS"))?;
    Ok(serde_json::from_slice(data)?)
}
