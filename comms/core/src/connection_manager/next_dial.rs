// Copyright 2025, The Driftsync Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use log::*;

use crate::types::DeviceId;

const LOG_TARGET: &str = "comms::connection_manager::next_dial";

/// A dial attempt always pushes the address's next dial at least this far
/// into the future, so parse and factory errors cannot retry in a tight loop.
pub const MIN_REDIAL_INTERVAL: Duration = Duration::from_secs(60);

const COOL_DOWN_ATTEMPTS: usize = 3;
const COOL_DOWN_WINDOW: Duration = Duration::from_secs(120);
const COOL_DOWN_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct DeviceDialState {
    next_dial: HashMap<String, Instant>,
    forced_redials: VecDeque<Instant>,
    cool_down_until: Option<Instant>,
}

/// Per-device redial bookkeeping. Owned and mutated exclusively by the dial
/// loop, so no synchronization is required.
#[derive(Debug, Default)]
pub struct NextDialRegistry {
    devices: HashMap<DeviceId, DeviceDialState>,
}

impl NextDialRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether the address may be dialed now.
    pub fn is_due(&self, device_id: &DeviceId, address: &str, now: Instant) -> bool {
        self.devices
            .get(device_id)
            .and_then(|state| state.next_dial.get(address))
            .map(|at| *at <= now)
            .unwrap_or(true)
    }

    /// Record a dial attempt against an address, pushing its next dial to
    /// `now + max(interval, MIN_REDIAL_INTERVAL)`. Called before the dial
    /// begins.
    pub fn register_attempt(&mut self, device_id: &DeviceId, address: &str, now: Instant, interval: Duration) {
        let next = now + interval.max(MIN_REDIAL_INTERVAL);
        self.devices
            .entry(*device_id)
            .or_default()
            .next_dial
            .insert(address.to_string(), next);
    }

    /// Forced redial: clear the device's next-dial times so the next
    /// iteration dials it immediately. Once three forced redials land within
    /// a two-minute window the device enters a five-minute cool-down during
    /// which further forced redials are no-ops; regular dials still proceed.
    pub fn redial_device(&mut self, device_id: &DeviceId, now: Instant) -> bool {
        let state = self.devices.entry(*device_id).or_default();

        if let Some(until) = state.cool_down_until {
            if now < until {
                debug!(
                    target: LOG_TARGET,
                    "Forced redial of device '{}' suppressed by cool-down for another {:.0}s",
                    device_id.short_str(),
                    (until - now).as_secs_f64()
                );
                return false;
            }
            state.cool_down_until = None;
            state.forced_redials.clear();
        }

        while let Some(first) = state.forced_redials.front() {
            if now.saturating_duration_since(*first) > COOL_DOWN_WINDOW {
                state.forced_redials.pop_front();
            } else {
                break;
            }
        }
        state.forced_redials.push_back(now);
        if state.forced_redials.len() >= COOL_DOWN_ATTEMPTS {
            debug!(
                target: LOG_TARGET,
                "Device '{}' was force-redialed {} times within {}s; cooling down",
                device_id.short_str(),
                state.forced_redials.len(),
                COOL_DOWN_WINDOW.as_secs()
            );
            state.cool_down_until = Some(now + COOL_DOWN_DURATION);
        }

        state.next_dial.clear();
        true
    }

    /// Time until the earliest scheduled dial, if any. Used to clamp the dial
    /// loop's sleep.
    pub fn next_event_after(&self, now: Instant) -> Option<Duration> {
        self.devices
            .values()
            .flat_map(|state| state.next_dial.values())
            .map(|at| at.saturating_duration_since(now))
            .min()
    }

    /// Drop bookkeeping for devices no longer in the configuration.
    pub fn retain_devices(&mut self, keep: impl Fn(&DeviceId) -> bool) {
        self.devices.retain(|device_id, _| keep(device_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::from_certificate(b"test device")
    }

    #[test]
    fn unknown_address_is_due() {
        let registry = NextDialRegistry::new();
        assert!(registry.is_due(&device(), "tcp://10.0.0.1:22000", Instant::now()));
    }

    #[test]
    fn attempt_pushes_next_dial_at_least_a_minute() {
        let mut registry = NextDialRegistry::new();
        let d = device();
        let addr = "tcp://10.0.0.1:22000";
        let now = Instant::now();

        // Even a zero redial interval is clamped up
        registry.register_attempt(&d, addr, now, Duration::ZERO);
        assert!(!registry.is_due(&d, addr, now));
        assert!(!registry.is_due(&d, addr, now + Duration::from_secs(59)));
        assert!(registry.is_due(&d, addr, now + Duration::from_secs(61)));

        registry.register_attempt(&d, addr, now, Duration::from_secs(600));
        assert!(!registry.is_due(&d, addr, now + Duration::from_secs(599)));
        assert!(registry.is_due(&d, addr, now + Duration::from_secs(601)));
    }

    #[test]
    fn forced_redial_clears_next_dial() {
        let mut registry = NextDialRegistry::new();
        let d = device();
        let addr = "tcp://10.0.0.1:22000";
        let now = Instant::now();

        registry.register_attempt(&d, addr, now, Duration::ZERO);
        assert!(!registry.is_due(&d, addr, now));
        assert!(registry.redial_device(&d, now));
        assert!(registry.is_due(&d, addr, now));
    }

    #[test]
    fn cool_down_after_three_forced_redials() {
        let mut registry = NextDialRegistry::new();
        let d = device();
        let start = Instant::now();

        // Three forced redials within the window proceed
        assert!(registry.redial_device(&d, start));
        assert!(registry.redial_device(&d, start + Duration::from_secs(30)));
        assert!(registry.redial_device(&d, start + Duration::from_secs(60)));

        // The fourth within the cool-down is a no-op
        assert!(!registry.redial_device(&d, start + Duration::from_secs(90)));
        assert!(!registry.redial_device(&d, start + Duration::from_secs(300)));

        // After the cool-down elapses, forced redials proceed again
        assert!(registry.redial_device(&d, start + Duration::from_secs(60 + 301)));
    }

    #[test]
    fn spread_out_redials_never_cool_down() {
        let mut registry = NextDialRegistry::new();
        let d = device();
        let start = Instant::now();
        for i in 0..10 {
            assert!(registry.redial_device(&d, start + Duration::from_secs(i * 90)));
        }
    }

    #[test]
    fn next_event_after_returns_earliest() {
        let mut registry = NextDialRegistry::new();
        let d = device();
        let now = Instant::now();
        assert_eq!(registry.next_event_after(now), None);

        registry.register_attempt(&d, "tcp://10.0.0.1:22000", now, Duration::from_secs(120));
        registry.register_attempt(&d, "tcp://10.0.0.2:22000", now, Duration::from_secs(80));
        let next = registry.next_event_after(now).unwrap();
        assert_eq!(next, Duration::from_secs(80));

        // Past-due entries clamp to zero
        let later = now + Duration::from_secs(100);
        assert_eq!(registry.next_event_after(later), Some(Duration::ZERO));
    }

    #[test]
    fn retain_devices_drops_removed() {
        let mut registry = NextDialRegistry::new();
        let d = device();
        registry.register_attempt(&d, "tcp://10.0.0.1:22000", Instant::now(), Duration::ZERO);
        registry.retain_devices(|_| false);
        assert_eq!(registry.next_event_after(Instant::now()), None);
    }
}
