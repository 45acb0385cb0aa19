//! Shared model projection.
//!
//! The model is the one-directional sink the UI reads: the connectivity
//! manager, release checker and update pipeline write their state into it,
//! nothing in this core reads authoritative state back out of it. The
//! firmware wraps it in an `Arc<Mutex<_>>`.

use serde::Serialize;

use crate::link::{ScanList, WifiSnapshot};
use crate::release::ReleaseCheckState;
use crate::update::UpdateState;

#[derive(Clone, Debug, Default, Serialize)]
pub struct Model {
    pub wifi: WifiSnapshot,
    /// Last completed scan, replaced wholesale; stale between scans.
    pub access_points: ScanList,
    /// Set when a scan is requested, cleared when its result is drained.
    pub scanning: bool,
    pub latest_release: ReleaseCheckState,
    pub firmware_update: UpdateState,
}

impl Model {
    /// Dotted-quad rendering of the current address, for logs and the
    /// status endpoint.
    pub fn ip_string(&self) -> String {
        let ip = self.wifi.ip;
        format!(
            "{}.{}.{}.{}",
            ip & 0xff,
            (ip >> 8) & 0xff,
            (ip >> 16) & 0xff,
            (ip >> 24) & 0xff
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_renders_little_endian_quads() {
        let mut model = Model::default();
        model.wifi.ip = 0x0101_a8c0; // 192.168.1.1 as delivered by lwip
        assert_eq!(model.ip_string(), "192.168.1.1");
    }
}
