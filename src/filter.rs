use crate::protocol::CELL_COUNT;
use serde::{Deserialize, Serialize};

/// Minimum number of in-range cells required to keep a cell array at all.
pub const MIN_VALID_CELLS: usize = 8;

/// Plausibility bounds applied to decoded values.
///
/// Every bound is a tunable: observed firmware variants disagree on the
/// temperature limits, so nothing here is hardcoded at the call sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Raw cell voltage scalar bounds (millivolt-equivalent).
    pub cell_min: u16,
    pub cell_max: u16,
    /// Pack voltage bounds in volts; a violation gates the whole reading.
    pub voltage_min: f64,
    pub voltage_max: f64,
    /// State of charge bounds in percent; a violation gates the whole reading.
    pub soc_min: f64,
    pub soc_max: f64,
    /// Temperature bounds in degrees Celsius.
    pub temp_min: f64,
    pub temp_max: f64,
    /// Largest accepted sample-to-sample temperature jump in degrees Celsius.
    pub temp_delta_limit: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cell_min: 2450,
            cell_max: 4750,
            voltage_min: 40.00,
            voltage_max: 60.00,
            soc_min: 0.0,
            soc_max: 100.0,
            temp_min: -20.0,
            temp_max: 55.0,
            temp_delta_limit: 10.0,
        }
    }
}

impl Limits {
    pub fn cell_ok(&self, raw: u16) -> bool {
        (self.cell_min..=self.cell_max).contains(&raw)
    }

    pub fn voltage_ok(&self, voltage: f64) -> bool {
        (self.voltage_min..=self.voltage_max).contains(&voltage)
    }

    pub fn soc_ok(&self, soc: f64) -> bool {
        (self.soc_min..=self.soc_max).contains(&soc)
    }

    pub fn temperature_ok(&self, temperature: f64) -> bool {
        (self.temp_min..=self.temp_max).contains(&temperature)
    }

    /// Blanks implausible cells; keeps the array only if at least
    /// [`MIN_VALID_CELLS`] entries survive.
    pub fn filter_cells(&self, raw: &[u16; CELL_COUNT]) -> Option<[Option<u16>; CELL_COUNT]> {
        let mut filtered = [None; CELL_COUNT];
        let mut valid = 0;
        for (slot, &cell) in filtered.iter_mut().zip(raw.iter()) {
            if self.cell_ok(cell) {
                *slot = Some(cell);
                valid += 1;
            }
        }
        if valid >= MIN_VALID_CELLS {
            Some(filtered)
        } else {
            log::warn!(
                "Discarding cell array - only {valid} of {CELL_COUNT} cells within [{}, {}]",
                self.cell_min,
                self.cell_max
            );
            None
        }
    }

    /// Drops implausible values from the main temperature sequence.
    pub fn filter_temperatures(&self, temperatures: &[f64]) -> Vec<f64> {
        temperatures
            .iter()
            .copied()
            .filter(|&t| {
                let ok = self.temperature_ok(t);
                if !ok {
                    log::warn!(
                        "Dropping implausible temperature {t} outside [{}, {}]",
                        self.temp_min,
                        self.temp_max
                    );
                }
                ok
            })
            .collect()
    }

    /// Bounds the (mos, env) pair. If either half is implausible the whole
    /// pair is withheld; the two are never published alone.
    pub fn filter_extra(&self, mos: f64, env: f64) -> Option<(f64, f64)> {
        if self.temperature_ok(mos) && self.temperature_ok(env) {
            Some((mos, env))
        } else {
            log::warn!("Withholding mos/env pair - mos={mos} env={env} outside bounds");
            None
        }
    }
}
