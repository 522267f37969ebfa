use crate::protocol::Address;
use std::collections::HashMap;

/// Last trusted values for one battery, carried across poll cycles.
#[derive(Debug, Default, Clone)]
struct BatteryState {
    last_cycle: Option<u16>,
    last_temperatures: Vec<f64>,
    last_mos: Option<f64>,
    last_env: Option<f64>,
}

/// Per-battery reconciliation state for the whole process lifetime.
///
/// Entries are created lazily on the first accepted value for an address
/// and are never persisted. All mutation happens through the reconcile
/// methods; one poll cycle runs at a time, so no locking is involved.
#[derive(Debug)]
pub struct Reconciler {
    delta_limit: f64,
    states: HashMap<Address, BatteryState>,
}

impl Reconciler {
    pub fn new(delta_limit: f64) -> Self {
        Self {
            delta_limit,
            states: HashMap::new(),
        }
    }

    /// Emits the new cycle count when one was decoded, falling back to the
    /// stored baseline to ride out a transient read failure.
    pub fn reconcile_cycle(&mut self, address: Address, cycle: Option<u16>) -> Option<u16> {
        match cycle {
            Some(cycle) => {
                self.states.entry(address).or_default().last_cycle = Some(cycle);
                Some(cycle)
            }
            None => {
                let baseline = self.states.get(&address).and_then(|s| s.last_cycle);
                if let Some(baseline) = baseline {
                    log::debug!("Battery {address}: cycle count absent, reusing baseline {baseline}");
                }
                baseline
            }
        }
    }

    /// Masks sample-to-sample temperature spikes against the previously
    /// accepted sequence, aligned by position.
    ///
    /// The filtered sequence becomes the next baseline, so a single outlier
    /// cannot poison future comparisons. Positions beyond the stored
    /// baseline pass through unfiltered.
    pub fn reconcile_temperatures(&mut self, address: Address, new: &[f64]) -> Vec<f64> {
        let delta_limit = self.delta_limit;
        let state = self.states.entry(address).or_default();
        let filtered: Vec<f64> = new
            .iter()
            .enumerate()
            .map(|(i, &value)| match state.last_temperatures.get(i) {
                Some(&previous) if (value - previous).abs() > delta_limit => {
                    log::warn!(
                        "Battery {address}: temperature {i} spiked {previous} -> {value}, reusing {previous}"
                    );
                    previous
                }
                _ => value,
            })
            .collect();
        state.last_temperatures = filtered.clone();
        filtered
    }

    /// Applies the spike policy independently to the mos and env slots.
    ///
    /// A slot's baseline only moves when its new value passes the delta
    /// check (or no baseline exists yet).
    pub fn reconcile_extra(
        &mut self,
        address: Address,
        pair: Option<(f64, f64)>,
    ) -> Option<(f64, f64)> {
        let (mos, env) = pair?;
        let delta_limit = self.delta_limit;
        let state = self.states.entry(address).or_default();
        let mos = Self::reconcile_slot(&mut state.last_mos, mos, delta_limit);
        let env = Self::reconcile_slot(&mut state.last_env, env, delta_limit);
        Some((mos, env))
    }

    fn reconcile_slot(baseline: &mut Option<f64>, new: f64, delta_limit: f64) -> f64 {
        match *baseline {
            Some(previous) if (new - previous).abs() > delta_limit => previous,
            _ => {
                *baseline = Some(new);
                new
            }
        }
    }
}
