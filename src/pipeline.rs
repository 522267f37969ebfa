use crate::filter::Limits;
use crate::history::Reconciler;
use crate::protocol::{
    Address, BlockReading, CellVoltages, ExtraTemperatures, Temperatures, CELL_COUNT,
};
use serde::{Deserialize, Serialize};

/// Raw reply buffers gathered for one battery in one poll cycle.
///
/// A `None` means the transport produced nothing usable for that query;
/// the pipeline treats it the same as an undecodable buffer.
#[derive(Debug, Default, Clone)]
pub struct RawFrames {
    pub block: Option<Vec<u8>>,
    pub cells: Option<Vec<u8>>,
    pub temperature: Option<Vec<u8>>,
    pub extra_temperature: Option<Vec<u8>>,
}

/// Why a battery produced no record this cycle.
///
/// These are expected, routine conditions - the caller logs them and moves
/// on to the next battery; the next poll cycle is the only retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GateFailure {
    #[error("block reading absent (voltage/current/soc unavailable)")]
    BlockMissing,
    #[error("pack voltage {0} V out of bounds")]
    VoltageOutOfRange(f64),
    #[error("state of charge {0} % out of bounds")]
    SocOutOfRange(f64),
    #[error("first cell voltage {0} mV implausible")]
    CellImplausible(u16),
}

/// One normalized, validated, spike-filtered reading for one battery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub voltage: f64,
    pub soc: f64,
    pub current: f64,
    pub power: f64,
    pub cycle: Option<u16>,
    pub cells: Option<[Option<u16>; CELL_COUNT]>,
    pub temps: Option<Vec<f64>>,
    pub mos_temp: Option<f64>,
    pub env_temp: Option<f64>,
}

/// Decode -> range-filter -> reconcile -> assemble, for one battery at a time.
///
/// Owns the reconciliation state; thread it through every poll cycle
/// instead of keeping history in globals.
#[derive(Debug)]
pub struct Pipeline {
    limits: Limits,
    reconciler: Reconciler,
}

impl Pipeline {
    pub fn new(limits: Limits) -> Self {
        let reconciler = Reconciler::new(limits.temp_delta_limit);
        Self { limits, reconciler }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Runs one battery's frames through the full pipeline.
    ///
    /// The gate is all-or-nothing: voltage, soc and current must be present
    /// and plausible, and a present cell array must lead with a plausible
    /// cell. On a failed gate nothing is emitted and the reconciliation
    /// baselines stay untouched.
    pub fn process(
        &mut self,
        address: Address,
        frames: &RawFrames,
    ) -> Result<TelemetryRecord, GateFailure> {
        let block = frames
            .block
            .as_deref()
            .and_then(BlockReading::decode)
            .ok_or(GateFailure::BlockMissing)?;
        if !self.limits.voltage_ok(block.voltage) {
            return Err(GateFailure::VoltageOutOfRange(block.voltage));
        }
        if !self.limits.soc_ok(block.soc) {
            return Err(GateFailure::SocOutOfRange(block.soc));
        }

        let raw_cells = frames
            .cells
            .as_deref()
            .and_then(|buffer| CellVoltages::decode(buffer, address));
        let cells = match raw_cells {
            Some(raw) => {
                let filtered = self.limits.filter_cells(&raw);
                if let Some(filtered) = &filtered {
                    if filtered[0].is_none() {
                        return Err(GateFailure::CellImplausible(raw[0]));
                    }
                }
                filtered
            }
            None => None,
        };

        let temps = frames
            .temperature
            .as_deref()
            .and_then(Temperatures::decode)
            .map(|decoded| self.limits.filter_temperatures(&decoded))
            .filter(|filtered| !filtered.is_empty())
            .map(|filtered| self.reconciler.reconcile_temperatures(address, &filtered));

        let extra = frames
            .extra_temperature
            .as_deref()
            .and_then(ExtraTemperatures::decode)
            .and_then(|(mos, env)| self.limits.filter_extra(mos, env));
        let extra = self.reconciler.reconcile_extra(address, extra);
        let (mos_temp, env_temp) = match extra {
            Some((mos, env)) => (Some(mos), Some(env)),
            None => (None, None),
        };

        let cycle = self.reconciler.reconcile_cycle(address, Some(block.cycle));

        Ok(TelemetryRecord {
            voltage: block.voltage,
            soc: block.soc,
            current: block.current,
            power: block.power,
            cycle,
            cells,
            temps,
            mos_temp,
            env_temp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::{
        addr, block_frame, cells_frame, extra_frame, temperature_frame,
    };

    fn healthy_frames() -> RawFrames {
        RawFrames {
            block: Some(block_frame(0x0140, 5399, 874, 121)),
            cells: Some(cells_frame(1, &[3300; CELL_COUNT])),
            temperature: Some(temperature_frame(&[976, 986, 966, 976])),
            extra_temperature: Some(extra_frame(826, 776)),
        }
    }

    #[test]
    fn healthy_cycle_produces_full_record() {
        let mut pipeline = Pipeline::new(Limits::default());
        let record = pipeline.process(addr(1), &healthy_frames()).unwrap();
        assert_eq!(record.voltage, 53.99);
        assert_eq!(record.soc, 87.4);
        assert_eq!(record.current, 3.2);
        assert_eq!(record.power, 172.77);
        assert_eq!(record.cycle, Some(121));
        assert_eq!(record.cells.unwrap(), [Some(3300); CELL_COUNT]);
        assert_eq!(record.temps.unwrap(), vec![47.6, 48.6, 46.6, 47.6]);
        assert_eq!(record.mos_temp, Some(32.6));
        assert_eq!(record.env_temp, Some(27.6));
    }

    #[test]
    fn gate_fails_without_block_frame() {
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = RawFrames {
            block: None,
            ..healthy_frames()
        };
        assert_eq!(
            pipeline.process(addr(1), &frames),
            Err(GateFailure::BlockMissing)
        );
    }

    #[test]
    fn gate_fails_on_voltage_out_of_bounds_despite_healthy_cells() {
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = RawFrames {
            block: Some(block_frame(0x0140, 6100, 874, 121)), // 61.00 V
            ..healthy_frames()
        };
        assert_eq!(
            pipeline.process(addr(1), &frames),
            Err(GateFailure::VoltageOutOfRange(61.0))
        );
    }

    #[test]
    fn gate_fails_on_soc_out_of_bounds() {
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = RawFrames {
            block: Some(block_frame(0x0140, 5399, 1010, 121)), // 101.0 %
            ..healthy_frames()
        };
        assert_eq!(
            pipeline.process(addr(1), &frames),
            Err(GateFailure::SocOutOfRange(101.0))
        );
    }

    #[test]
    fn gate_fails_when_first_cell_implausible() {
        let mut pipeline = Pipeline::new(Limits::default());
        let mut raw = [3300u16; CELL_COUNT];
        raw[0] = 100;
        let frames = RawFrames {
            cells: Some(cells_frame(1, &raw)),
            ..healthy_frames()
        };
        assert_eq!(
            pipeline.process(addr(1), &frames),
            Err(GateFailure::CellImplausible(100))
        );
    }

    #[test]
    fn sub_components_are_independently_optional() {
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = RawFrames {
            block: Some(block_frame(0x0140, 5399, 874, 121)),
            cells: None,
            temperature: None,
            extra_temperature: None,
        };
        let record = pipeline.process(addr(1), &frames).unwrap();
        assert!(record.cells.is_none());
        assert!(record.temps.is_none());
        assert!(record.mos_temp.is_none());
        assert!(record.env_temp.is_none());
        assert_eq!(record.cycle, Some(121));
    }

    #[test]
    fn discarded_cell_array_does_not_gate() {
        // Fewer than eight plausible cells: the array resolves to absent,
        // but the record itself still publishes.
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = RawFrames {
            cells: Some(cells_frame(1, &[100; CELL_COUNT])),
            ..healthy_frames()
        };
        let record = pipeline.process(addr(1), &frames).unwrap();
        assert!(record.cells.is_none());
    }

    #[test]
    fn misaddressed_cell_frame_resolves_to_absent_cells() {
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = RawFrames {
            cells: Some(cells_frame(3, &[3300; CELL_COUNT])),
            ..healthy_frames()
        };
        let record = pipeline.process(addr(1), &frames).unwrap();
        assert!(record.cells.is_none());
    }

    #[test]
    fn repeated_frames_are_idempotent() {
        let mut pipeline = Pipeline::new(Limits::default());
        let frames = healthy_frames();
        let first = pipeline.process(addr(1), &frames).unwrap();
        let second = pipeline.process(addr(1), &frames).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn spike_filter_carries_across_cycles() {
        let mut pipeline = Pipeline::new(Limits::default());
        let first = RawFrames {
            temperature: Some(temperature_frame(&[750, 750])), // 25.0 each
            ..healthy_frames()
        };
        pipeline.process(addr(1), &first).unwrap();
        let second = RawFrames {
            temperature: Some(temperature_frame(&[950, 755])), // 45.0, 25.5
            ..healthy_frames()
        };
        let record = pipeline.process(addr(1), &second).unwrap();
        assert_eq!(record.temps.unwrap(), vec![25.0, 25.5]);
    }

    #[test]
    fn gate_failure_leaves_reconciler_untouched() {
        let mut pipeline = Pipeline::new(Limits::default());
        let healthy = RawFrames {
            temperature: Some(temperature_frame(&[750])), // 25.0
            ..healthy_frames()
        };
        pipeline.process(addr(1), &healthy).unwrap();
        // Failed gate with a spiked temperature: nothing is emitted and the
        // 25.0 baseline must survive for the next healthy cycle.
        let failed = RawFrames {
            block: None,
            temperature: Some(temperature_frame(&[950])), // 45.0
            ..healthy_frames()
        };
        assert!(pipeline.process(addr(1), &failed).is_err());
        let next = RawFrames {
            temperature: Some(temperature_frame(&[950])), // 45.0 again
            ..healthy_frames()
        };
        let record = pipeline.process(addr(1), &next).unwrap();
        assert_eq!(record.temps.unwrap(), vec![25.0]);
    }
}
