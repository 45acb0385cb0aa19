//! Control tick: the only entry point the outer application loop calls.
//!
//! Each tick refreshes the model from the link record, drains completed
//! scans, schedules release re-checks and advances whichever transfer is in
//! flight by one bounded step. Nothing here blocks beyond that step.

use std::sync::{Arc, Mutex};

use clock_core::link::LinkState;
use clock_core::model::Model;
use clock_core::release::{update_available, ReleaseCheckState};
use clock_core::schedule::{is_expired, CheckSchedule, Ticks, SCAN_RETRY_DELAY};
use clock_core::update::{PullUpdate, UpdateState};

use crate::network::NetContext;
use crate::ota::{HttpSource, OtaManager};
use crate::release::ReleaseChecker;
use crate::version;

/// Period of the outer loop.
pub const CONTROL_TICK_MS: u32 = 10;

pub struct Controller {
    ctx: Arc<NetContext>,
    model: Arc<Mutex<Model>>,
    checker: ReleaseChecker,
    schedule: CheckSchedule,
    pull: Option<PullUpdate<HttpSource, OtaManager>>,
    /// When the currently pending deferred scan was first observed.
    scan_retry_since: Option<Ticks>,
}

impl Controller {
    pub fn new(ctx: Arc<NetContext>, model: Arc<Mutex<Model>>) -> Self {
        Self {
            ctx,
            model,
            checker: ReleaseChecker::new(),
            schedule: CheckSchedule::new(),
            pull: None,
            scan_retry_since: None,
        }
    }

    /// One control tick.
    pub fn manage(&mut self) {
        let now = ticks_ms();

        // Refresh the link snapshot and drain a completed scan.
        let (snapshot, drained) = match self.ctx.link.lock() {
            Ok(mut link) => (link.snapshot(), link.take_scan_results()),
            Err(_) => return,
        };
        let (connected, release_state, update_state) = match self.model.lock() {
            Ok(mut model) => {
                model.wifi = snapshot;
                if let Some(aps) = drained {
                    model.access_points = aps;
                    model.scanning = false;
                }
                (
                    model.wifi.state == LinkState::Connected,
                    model.latest_release,
                    model.firmware_update,
                )
            }
            Err(_) => return,
        };

        // A deferred scan the link never unblocked gets retried on a timer.
        if self.ctx.deferred_scan_pending() {
            match self.scan_retry_since {
                None => self.scan_retry_since = Some(now),
                Some(since) if is_expired(since, now, SCAN_RETRY_DELAY) => {
                    self.scan_retry_since = None;
                    self.ctx.retry_deferred_scan();
                }
                Some(_) => {}
            }
        } else {
            self.scan_retry_since = None;
        }

        // First check right after the link comes up, then one hour after an
        // error and twelve hours after a completed check.
        if connected && !self.checker.in_flight() && self.schedule.due(now, &release_state) {
            self.checker.start(&self.model);
            self.schedule.mark(now);
        }
        if self.checker.poll(&self.model) {
            self.log_check_outcome();
        }

        if self.ctx.take_update_request() {
            self.start_pull_update(update_state);
        }
        self.step_pull_update();
    }

    fn log_check_outcome(&self) {
        let Ok(model) = self.model.lock() else { return };
        if let ReleaseCheckState::Done(latest) = model.latest_release {
            let current = version::current();
            if update_available(current, latest) {
                log::info!("update available: {current} -> {latest}");
            } else {
                log::info!("firmware {current} is up to date");
            }
        }
    }

    /// Pull entry point, taken when the user asks for the discovered
    /// release to be installed.
    fn start_pull_update(&mut self, update_state: UpdateState) {
        if self.pull.is_some() || !update_state.can_start() {
            log::warn!("update already in progress");
            return;
        }
        let Some(url) = self.checker.asset_url().map(str::to_string) else {
            log::warn!("no release asset discovered, ignoring update request");
            return;
        };
        self.set_update_state(UpdateState::Updating);
        let outcome =
            HttpSource::open(&url).and_then(|source| PullUpdate::begin(source, OtaManager::new()));
        match outcome {
            Ok(pull) => self.pull = Some(pull),
            Err(failure) => {
                log::error!("could not start firmware update: {failure}");
                self.set_update_state(UpdateState::Failure(failure));
            }
        }
    }

    fn step_pull_update(&mut self) {
        let Some(pull) = self.pull.as_mut() else {
            return;
        };
        if let Some(outcome) = pull.step() {
            let state = match outcome {
                Ok(()) => {
                    log::info!("firmware update complete, reset the device to apply");
                    UpdateState::Success
                }
                Err(failure) => {
                    log::error!("firmware update failed: {failure}");
                    UpdateState::Failure(failure)
                }
            };
            self.set_update_state(state);
            self.pull = None;
        }
    }

    fn set_update_state(&self, state: UpdateState) {
        if let Ok(mut model) = self.model.lock() {
            model.firmware_update = state;
        }
    }
}

fn ticks_ms() -> Ticks {
    (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as Ticks
}
