//! The closed telemetry field set and its store.
//!
//! Twenty fields, fixed at compile time. Keeping the set closed lets the
//! store be a pair of parallel arrays indexed by the enum discriminant:
//! O(1) access, no hashing, no allocation.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Number of telemetry fields.
pub const FIELD_COUNT: usize = 20;

/// A telemetry field. Declaration order is emission order in the JSON log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryField {
    Utc,
    Soc,
    Power,
    Speed,
    Lat,
    Lon,
    IsCharging,
    IsDcfc,
    IsParked,
    Capacity,
    KwhCharged,
    Soh,
    Heading,
    Elevation,
    ExtTemp,
    BattTemp,
    Voltage,
    Current,
    Odometer,
    EstBatteryRange,
}

const_assert_eq!(TelemetryField::ALL.len(), FIELD_COUNT);

impl TelemetryField {
    /// Every field, in emission order.
    pub const ALL: [Self; FIELD_COUNT] = [
        Self::Utc,
        Self::Soc,
        Self::Power,
        Self::Speed,
        Self::Lat,
        Self::Lon,
        Self::IsCharging,
        Self::IsDcfc,
        Self::IsParked,
        Self::Capacity,
        Self::KwhCharged,
        Self::Soh,
        Self::Heading,
        Self::Elevation,
        Self::ExtTemp,
        Self::BattTemp,
        Self::Voltage,
        Self::Current,
        Self::Odometer,
        Self::EstBatteryRange,
    ];

    /// Stable name used as the JSON key and in configuration files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utc => "utc",
            Self::Soc => "soc",
            Self::Power => "power",
            Self::Speed => "speed",
            Self::Lat => "lat",
            Self::Lon => "lon",
            Self::IsCharging => "is_charging",
            Self::IsDcfc => "is_dcfc",
            Self::IsParked => "is_parked",
            Self::Capacity => "capacity",
            Self::KwhCharged => "kwh_charged",
            Self::Soh => "soh",
            Self::Heading => "heading",
            Self::Elevation => "elevation",
            Self::ExtTemp => "ext_temp",
            Self::BattTemp => "batt_temp",
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::Odometer => "odometer",
            Self::EstBatteryRange => "est_battery_range",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|field| field.name() == name)
    }

    /// Fields rendered as decimal integers in the JSON log: the timestamp
    /// and the three 0/1 flags.
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Utc | Self::IsCharging | Self::IsDcfc | Self::IsParked
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Validity-tracked storage for every telemetry field. All slots start
/// invalid; a write marks its slot valid and nothing in normal operation
/// clears it again for the rest of the session.
#[derive(Debug, Clone)]
pub struct FieldStore {
    valid: [bool; FIELD_COUNT],
    values: [f32; FIELD_COUNT],
}

impl Default for FieldStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            valid: [false; FIELD_COUNT],
            values: [0.0; FIELD_COUNT],
        }
    }

    pub fn set(&mut self, field: TelemetryField, value: f32) {
        self.values[field.index()] = value;
        self.valid[field.index()] = true;
    }

    #[must_use]
    pub fn is_valid(&self, field: TelemetryField) -> bool {
        self.valid[field.index()]
    }

    /// The field's value, if it has been written this session.
    #[must_use]
    pub fn get(&self, field: TelemetryField) -> Option<f32> {
        self.valid[field.index()]
            .then_some(self.values[field.index()])
    }

    /// Valid fields in emission order.
    pub fn iter_valid(&self) -> impl Iterator<Item = (TelemetryField, f32)> + '_ {
        TelemetryField::ALL
            .iter()
            .filter(|field| self.valid[field.index()])
            .map(|&field| (field, self.values[field.index()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for field in TelemetryField::ALL {
            assert_eq!(TelemetryField::from_name(field.name()), Some(field));
        }
        assert_eq!(TelemetryField::from_name("no_such_field"), None);
    }

    #[test]
    fn integer_fields() {
        let integers: Vec<_> = TelemetryField::ALL
            .into_iter()
            .filter(|field| field.is_integer())
            .collect();
        assert_eq!(
            integers,
            vec![
                TelemetryField::Utc,
                TelemetryField::IsCharging,
                TelemetryField::IsDcfc,
                TelemetryField::IsParked,
            ]
        );
    }

    #[test]
    fn store_starts_invalid_and_stays_valid_after_write() {
        let mut store = FieldStore::new();
        assert!(!store.is_valid(TelemetryField::Soc));
        assert_eq!(store.get(TelemetryField::Soc), None);

        store.set(TelemetryField::Soc, 61.0);
        assert_eq!(store.get(TelemetryField::Soc), Some(61.0));

        // Overwrites update the value, never the validity.
        store.set(TelemetryField::Soc, 60.5);
        assert_eq!(store.get(TelemetryField::Soc), Some(60.5));
        assert!(store.is_valid(TelemetryField::Soc));
    }

    #[test]
    fn iteration_follows_emission_order() {
        let mut store = FieldStore::new();
        store.set(TelemetryField::Voltage, 400.0);
        store.set(TelemetryField::Utc, 1_700_000_000.0);
        store.set(TelemetryField::Soc, 42.5);

        let order: Vec<_> = store.iter_valid().map(|(field, _)| field).collect();
        assert_eq!(
            order,
            vec![
                TelemetryField::Utc,
                TelemetryField::Soc,
                TelemetryField::Voltage,
            ]
        );
    }
}
