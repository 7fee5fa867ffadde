//! Telemetry scheduler and JSON emitter.
//!
//! The agent owns the field store and all wall-clock cadence. The host
//! drives it with a cooperative super-loop: `update_gps`, `update_utc`,
//! `poll_uds`, `log_json`, once per tick with the current monotonic
//! millisecond clock. Nothing here spawns or blocks beyond the CAN port's
//! own timeouts.

use core::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::can::{Bitrate, CanBus};
use crate::config::AgentConfig;
use crate::fields::{FieldStore, TelemetryField};
use crate::signal::{self, SignalConfig};
use crate::storage::LogSink;
use crate::uds::{self, UdsClient};

/// Emission buffer for one JSON record.
pub const JSON_LINE_CAPACITY: usize = 512;

/// Knots to km/h, the GPS receiver's native speed unit being knots.
pub const KNOTS_TO_KPH: f32 = 1.852;

const LOG_INTERVAL_MS: u32 = 1000;
const FLUSH_INTERVAL_MS: u32 = 5000;
const RESPONSE_BUFFER: usize = 64;

/// Power below this many kW means a DC fast charger is attached.
const DCFC_POWER_KW: f32 = -20.0;

/// Below this speed the vehicle counts as parked.
const PARKED_SPEED_KPH: f32 = 1.0;

/// One GPS snapshot. `speed` is in knots with negative meaning unknown;
/// zero lat/lng, heading, or altitude are treated as "no fix" for their
/// respective fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: f32,
    pub lng: f32,
    pub speed: f32,
    pub heading: u16,
    pub alt: f32,
}

/// Polls configured signals over UDS, synthesizes derived fields, and
/// appends one JSON record per second to the log sink.
pub struct TelemetryAgent<B: CanBus, S: LogSink> {
    enabled: bool,
    config: AgentConfig,
    uds: UdsClient<B>,
    sink: Option<S>,
    store: FieldStore,
    last_poll_ms: u32,
    last_log_ms: u32,
    last_flush_ms: u32,
}

impl<B: CanBus, S: LogSink> TelemetryAgent<B, S> {
    /// Takes ownership of the CAN port and the session configuration. The
    /// port is brought up eagerly but a failure is tolerated; the first
    /// request retries.
    pub fn new(bus: B, config: AgentConfig) -> Self {
        let mut uds = UdsClient::new(bus);
        if uds.start(Bitrate::default()).is_err() {
            debug!("CAN port not ready, will retry on first request");
        }
        info!(
            signals = config.signals.len(),
            interval_sec = config.send_interval_sec,
            "telemetry agent configured"
        );
        Self {
            enabled: true,
            config,
            uds,
            sink: None,
            store: FieldStore::new(),
            last_poll_ms: 0,
            last_log_ms: 0,
            last_flush_ms: 0,
        }
    }

    /// Attaches the session log sink once the host's storage is up. A
    /// no-op when the configuration disables the JSON log.
    pub fn set_storage_ready(&mut self, sink: S) {
        if !self.config.save_json_log {
            return;
        }
        info!("json log attached");
        self.sink = Some(sink);
    }

    /// Pauses or resumes the agent. While paused, timers freeze and no
    /// polling or emission happens.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Read-only view of the field store.
    #[must_use]
    pub fn fields(&self) -> &FieldStore {
        &self.store
    }

    /// Direct access to the CAN port, for hosts that own bus setup.
    pub fn bus_mut(&mut self) -> &mut B {
        self.uds.bus_mut()
    }

    /// The attached log sink, if any.
    pub fn sink_mut(&mut self) -> Option<&mut S> {
        self.sink.as_mut()
    }

    /// Folds a GPS snapshot into the store. Absent or zeroed readings
    /// leave their fields alone.
    pub fn update_gps(&mut self, fix: Option<&GpsFix>) {
        let Some(fix) = fix else { return };

        if fix.lat != 0.0 || fix.lng != 0.0 {
            self.store.set(TelemetryField::Lat, fix.lat);
            self.store.set(TelemetryField::Lon, fix.lng);
        }
        if fix.speed >= 0.0 {
            self.store.set(TelemetryField::Speed, fix.speed * KNOTS_TO_KPH);
        }
        if fix.heading != 0 {
            self.store.set(TelemetryField::Heading, f32::from(fix.heading));
        }
        if fix.alt != 0.0 {
            self.store.set(TelemetryField::Elevation, fix.alt);
        }
    }

    /// Samples the wall clock into the `utc` field.
    pub fn update_utc(&mut self) {
        if let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) {
            self.record_utc(elapsed.as_secs() as i64);
        }
    }

    /// Injectable wall-clock source behind [`Self::update_utc`].
    pub fn record_utc(&mut self, utc_seconds: i64) {
        if utc_seconds > 0 {
            self.store.set(TelemetryField::Utc, utc_seconds as f32);
        }
    }

    /// Runs one polling pass if the configured interval has elapsed:
    /// every signal in configured order, failures silently retried next
    /// tick, derived fields applied after the pass.
    pub fn poll_uds(&mut self, now_ms: u32) {
        if !self.enabled || self.config.signals.is_empty() {
            return;
        }

        let mut interval_ms = u32::from(self.config.send_interval_sec) * 1000;
        if interval_ms == 0 {
            interval_ms = LOG_INTERVAL_MS;
        }
        if now_ms.wrapping_sub(self.last_poll_ms) < interval_ms {
            return;
        }
        self.last_poll_ms = now_ms;

        let Self {
            config, uds, store, ..
        } = self;
        for signal in &config.signals {
            if let Some(value) = poll_signal(uds, signal) {
                store.set(signal.field, value);
            }
        }

        self.apply_derived();
    }

    /// Appends one JSON record if the sink is attached and a second has
    /// passed, flushing durably every five.
    pub fn log_json(&mut self, now_ms: u32) {
        if !self.enabled || !self.config.save_json_log {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if now_ms.wrapping_sub(self.last_log_ms) < LOG_INTERVAL_MS {
            return;
        }
        self.last_log_ms = now_ms;

        let line = render_line(&self.store);
        sink.write_line(&line);

        if now_ms.wrapping_sub(self.last_flush_ms) > FLUSH_INTERVAL_MS {
            sink.flush();
            self.last_flush_ms = now_ms;
        }
    }

    /// Derived fields, in dependency order. Each rule fires only while its
    /// target is still invalid; once set it behaves like any polled field.
    /// Negative power is energy flowing into the battery.
    fn apply_derived(&mut self) {
        let store = &mut self.store;

        if !store.is_valid(TelemetryField::Power) {
            if let (Some(voltage), Some(current)) = (
                store.get(TelemetryField::Voltage),
                store.get(TelemetryField::Current),
            ) {
                store.set(TelemetryField::Power, voltage * current / 1000.0);
            }
        }

        if !store.is_valid(TelemetryField::IsCharging) {
            if let Some(power) = store.get(TelemetryField::Power) {
                store.set(
                    TelemetryField::IsCharging,
                    if power < 0.0 { 1.0 } else { 0.0 },
                );
            }
        }

        if !store.is_valid(TelemetryField::IsDcfc) {
            if let Some(power) = store.get(TelemetryField::Power) {
                store.set(
                    TelemetryField::IsDcfc,
                    if power < DCFC_POWER_KW { 1.0 } else { 0.0 },
                );
            }
        }

        if !store.is_valid(TelemetryField::IsParked) {
            if let Some(speed) = store.get(TelemetryField::Speed) {
                store.set(
                    TelemetryField::IsParked,
                    if speed < PARKED_SPEED_KPH { 1.0 } else { 0.0 },
                );
            }
        }
    }
}

fn poll_signal<B: CanBus>(uds: &mut UdsClient<B>, signal: &SignalConfig) -> Option<f32> {
    if signal.request.is_empty() {
        return None;
    }
    let mut response = [0u8; RESPONSE_BUFFER];
    match uds.request(
        &signal.address,
        &signal.request,
        &mut response,
        uds::DEFAULT_TIMEOUT_MS,
    ) {
        Ok(n) => signal::decode(signal, &response[..n]),
        Err(err) => {
            debug!(signal = signal.name.as_str(), %err, "poll failed, will retry");
            None
        }
    }
}

/// Renders every valid field into one JSON object, in field order. Integer
/// fields print without a decimal point, everything else with three
/// decimals. If the record would overflow the buffer the remaining fields
/// are dropped and the record still closes.
fn render_line(store: &FieldStore) -> ArrayString<JSON_LINE_CAPACITY> {
    let mut line: ArrayString<JSON_LINE_CAPACITY> = ArrayString::new();
    line.push('{');

    for (field, value) in store.iter_valid() {
        let mut item: ArrayString<96> = ArrayString::new();
        let sep = if line.len() > 1 { "," } else { "" };
        let written = if field.is_integer() {
            write!(item, "{sep}\"{}\":{}", field.name(), value as i64)
        } else {
            write!(item, "{sep}\"{}\":{:.3}", field.name(), value)
        };
        if written.is_err() || line.len() + item.len() + 1 > line.capacity() {
            warn!(dropped_from = field.name(), "json record overflow");
            break;
        }
        line.push_str(&item);
    }

    line.push('}');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::EcuAddress;
    use crate::sim::{QueueBus, SimEcu};
    use crate::storage::MemorySink;
    use heapless::{String as HString, Vec as HVec};

    fn signal(
        field: TelemetryField,
        did: u16,
        length: u8,
        scale: f32,
        offset: f32,
    ) -> SignalConfig {
        let request = HVec::from_slice(&[0x22, (did >> 8) as u8, (did & 0xFF) as u8]).unwrap();
        SignalConfig {
            field,
            name: HString::new(),
            unit: HString::new(),
            address: EcuAddress::standard(0x7E4, 0x7EC),
            request,
            start_byte: 0,
            length,
            bit: None,
            scale,
            offset,
        }
    }

    fn agent_with(
        signals: &[SignalConfig],
        ecu: SimEcu,
    ) -> TelemetryAgent<SimEcu, MemorySink> {
        let mut config = AgentConfig::default();
        for signal in signals {
            config.signals.push(signal.clone()).unwrap();
        }
        let mut agent = TelemetryAgent::new(ecu, config);
        agent.set_storage_ready(MemorySink::new());
        agent
    }

    #[test]
    fn derived_power_and_flags_from_voltage_and_current() {
        let mut ecu = SimEcu::new();
        // 400.0 V and -30.0 A at scale 0.1, offset -3276.8
        ecu.add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9102, &[0x0F, 0xA0]);
        ecu.add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9103, &[0x7E, 0xD4]);

        let mut agent = agent_with(
            &[
                signal(TelemetryField::Voltage, 0x9102, 2, 0.1, 0.0),
                signal(TelemetryField::Current, 0x9103, 2, 0.1, -3276.8),
            ],
            ecu,
        );
        agent.poll_uds(1000);

        let store = agent.fields();
        assert_eq!(store.get(TelemetryField::Voltage), Some(400.0));
        assert_eq!(store.get(TelemetryField::Current), Some(-30.0));
        assert_eq!(store.get(TelemetryField::Power), Some(-12.0));
        assert_eq!(store.get(TelemetryField::IsCharging), Some(1.0));
        assert_eq!(store.get(TelemetryField::IsDcfc), Some(0.0));
    }

    #[test]
    fn dcfc_flag_below_threshold() {
        let mut ecu = SimEcu::new();
        // 400.0 V, -62.5 A -> -25 kW
        ecu.add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9102, &[0x0F, 0xA0]);
        ecu.add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9103, &[0x7D, 0x8F]);

        let mut agent = agent_with(
            &[
                signal(TelemetryField::Voltage, 0x9102, 2, 0.1, 0.0),
                signal(TelemetryField::Current, 0x9103, 2, 0.1, -3276.8),
            ],
            ecu,
        );
        agent.poll_uds(1000);

        let store = agent.fields();
        assert_eq!(store.get(TelemetryField::Power), Some(-25.0));
        assert_eq!(store.get(TelemetryField::IsCharging), Some(1.0));
        assert_eq!(store.get(TelemetryField::IsDcfc), Some(1.0));
    }

    #[test]
    fn gps_speed_converts_from_knots() {
        let mut agent: TelemetryAgent<QueueBus, MemorySink> =
            TelemetryAgent::new(QueueBus::new(), AgentConfig::default());
        let fix = GpsFix {
            lat: 52.1,
            lng: 5.2,
            speed: 10.0,
            heading: 90,
            alt: 12.0,
        };
        agent.update_gps(Some(&fix));

        let store = agent.fields();
        assert_eq!(store.get(TelemetryField::Speed), Some(18.52));
        assert_eq!(store.get(TelemetryField::Lat), Some(52.1));
        assert_eq!(store.get(TelemetryField::Lon), Some(5.2));
        assert_eq!(store.get(TelemetryField::Heading), Some(90.0));
        assert_eq!(store.get(TelemetryField::Elevation), Some(12.0));
    }

    #[test]
    fn gps_unknown_speed_and_empty_fix_leave_fields_alone() {
        let mut agent: TelemetryAgent<QueueBus, MemorySink> =
            TelemetryAgent::new(QueueBus::new(), AgentConfig::default());
        agent.update_gps(None);
        agent.update_gps(Some(&GpsFix {
            speed: -1.0,
            ..GpsFix::default()
        }));

        let store = agent.fields();
        assert!(!store.is_valid(TelemetryField::Speed));
        assert!(!store.is_valid(TelemetryField::Lat));
        assert!(!store.is_valid(TelemetryField::Heading));
    }

    #[test]
    fn render_exact_line_for_utc_and_soc() {
        let mut store = FieldStore::new();
        store.set(TelemetryField::Utc, 1_700_000_000.0);
        store.set(TelemetryField::Soc, 42.5);
        assert_eq!(
            render_line(&store).as_str(),
            "{\"utc\":1700000000,\"soc\":42.500}"
        );
    }

    #[test]
    fn render_empty_store_closes_record() {
        assert_eq!(render_line(&FieldStore::new()).as_str(), "{}");
    }

    #[test]
    fn render_flags_as_integers() {
        let mut store = FieldStore::new();
        store.set(TelemetryField::IsCharging, 1.0);
        store.set(TelemetryField::IsDcfc, 0.0);
        assert_eq!(
            render_line(&store).as_str(),
            "{\"is_charging\":1,\"is_dcfc\":0}"
        );
    }

    #[test]
    fn log_cadence_is_one_record_per_second() {
        let mut agent: TelemetryAgent<QueueBus, MemorySink> =
            TelemetryAgent::new(QueueBus::new(), AgentConfig::default());
        agent.set_storage_ready(MemorySink::new());
        agent.record_utc(1_700_000_000);

        agent.log_json(1000);
        agent.log_json(1400);
        agent.log_json(1999);
        agent.log_json(2000);

        assert_eq!(agent.sink.as_ref().unwrap().lines.len(), 2);
    }

    #[test]
    fn poll_cadence_follows_send_interval() {
        let mut ecu = SimEcu::new();
        ecu.add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9102, &[0x0F, 0xA0]);

        let mut config = AgentConfig::default();
        config.send_interval_sec = 2;
        config
            .signals
            .push(signal(TelemetryField::Voltage, 0x9102, 2, 0.1, 0.0))
            .unwrap();

        let mut agent: TelemetryAgent<SimEcu, MemorySink> = TelemetryAgent::new(ecu, config);
        agent.poll_uds(2000);
        assert_eq!(agent.bus_mut().requests_served(), 1);
        agent.poll_uds(2500);
        agent.poll_uds(3999);
        assert_eq!(agent.bus_mut().requests_served(), 1);
        agent.poll_uds(4000);
        assert_eq!(agent.bus_mut().requests_served(), 2);
    }

    #[test]
    fn disabled_agent_neither_polls_nor_logs() {
        let mut ecu = SimEcu::new();
        ecu.add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9102, &[0x0F, 0xA0]);

        let mut agent = agent_with(&[signal(TelemetryField::Voltage, 0x9102, 2, 0.1, 0.0)], ecu);
        agent.set_enabled(false);

        agent.record_utc(1_700_000_000);
        agent.poll_uds(1000);
        agent.log_json(1000);

        // GPS and wall-clock snapshots still land; the bus and sink stay quiet.
        assert!(agent.fields().is_valid(TelemetryField::Utc));
        assert!(!agent.fields().is_valid(TelemetryField::Voltage));
        assert_eq!(agent.sink.as_ref().unwrap().lines.len(), 0);

        agent.set_enabled(true);
        agent.poll_uds(1000);
        assert_eq!(agent.fields().get(TelemetryField::Voltage), Some(400.0));
    }

    #[test]
    fn sink_ignored_when_log_disabled() {
        let mut config = AgentConfig::default();
        config.save_json_log = false;
        let mut agent: TelemetryAgent<QueueBus, MemorySink> =
            TelemetryAgent::new(QueueBus::new(), config);
        agent.set_storage_ready(MemorySink::new());
        assert!(agent.sink.is_none());
    }

    #[test]
    fn failed_signal_retries_next_tick() {
        // No DID registered: every request draws a timeout.
        let mut agent = agent_with(
            &[signal(TelemetryField::Soc, 0x9101, 1, 0.5, 0.0)],
            SimEcu::new(),
        );
        agent.poll_uds(1000);
        assert!(!agent.fields().is_valid(TelemetryField::Soc));

        // The ECU comes alive; the next tick picks the value up.
        agent
            .bus_mut()
            .add_did(EcuAddress::standard(0x7E4, 0x7EC), 0x9101, &[0x7A]);
        agent.poll_uds(2000);
        assert_eq!(agent.fields().get(TelemetryField::Soc), Some(61.0));
    }
}
