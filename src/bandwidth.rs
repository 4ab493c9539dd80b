//! Amplifier bandwidth and DSP cutoff models.
//!
//! The on-chip bandwidth resistors RH1, RH2 and RL are each a base resistance
//! plus DAC-selected unit steps. The relation between resistance and corner
//! frequency is an empirical quadratic (or cubic) fit in `log10(f)`; the
//! forward fits turn a requested corner into a target resistance, and the
//! inverse fits turn the resistance the DACs can actually realize back into
//! the corner frequency the chip will have.

use std::f64::consts::PI;

/// Highest supported upper bandwidth, in Hz.
pub const MAX_UPPER_BANDWIDTH: f64 = 30000.0;
/// Highest supported lower bandwidth, in Hz.
pub const MAX_LOWER_BANDWIDTH: f64 = 1500.0;
/// Below this lower bandwidth the RL DAC3 (3 MΩ) step is switched in.
const RL_DAC3_THRESHOLD: f64 = 0.15;

/// Number of usable DSP cutoff codes (1..=15).
pub const DSP_CUTOFF_CODES: u8 = 15;

/// A resistor built from a base value plus two DAC-controlled step ladders.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ResistorDac {
    base: f64,
    dac1_unit: f64,
    dac1_steps: u32,
    dac2_unit: f64,
    dac2_steps: u32,
}

const RH1: ResistorDac = ResistorDac {
    base: 2200.0,
    dac1_unit: 600.0,
    dac1_steps: 63,
    dac2_unit: 29400.0,
    dac2_steps: 31,
};

const RH2: ResistorDac = ResistorDac {
    base: 8700.0,
    dac1_unit: 763.0,
    dac1_steps: 63,
    dac2_unit: 38400.0,
    dac2_steps: 31,
};

const RL: ResistorDac = ResistorDac {
    base: 3500.0,
    dac1_unit: 175.0,
    dac1_steps: 127,
    dac2_unit: 12700.0,
    dac2_steps: 63,
};
const RL_DAC3_UNIT: f64 = 3_000_000.0;

/// DAC codes realizing one resistor, and the resulting resistance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DacFit {
    pub dac1: u8,
    pub dac2: u8,
    pub resistance: f64,
}

impl ResistorDac {
    /// Coarse-then-fine greedy search starting from `start`.
    ///
    /// DAC2 steps are taken while the remaining shortfall exceeds one DAC2
    /// unit less half a DAC1 unit, then DAC1 steps while it exceeds half a
    /// DAC1 unit. The order and thresholds matter: this is not equivalent to
    /// dividing the shortfall by the unit sizes.
    fn fit_from(&self, start: f64, target: f64) -> DacFit {
        let mut fit = DacFit {
            dac1: 0,
            dac2: 0,
            resistance: start,
        };
        for _ in 0..self.dac2_steps {
            if fit.resistance < target - (self.dac2_unit - self.dac1_unit / 2.0) {
                fit.resistance += self.dac2_unit;
                fit.dac2 += 1;
            }
        }
        for _ in 0..self.dac1_steps {
            if fit.resistance < target - self.dac1_unit / 2.0 {
                fit.resistance += self.dac1_unit;
                fit.dac1 += 1;
            }
        }
        fit
    }
}

/// Result of fitting the upper bandwidth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpperBandwidthFit {
    pub rh1: DacFit,
    pub rh2: DacFit,
    /// Achieved corner frequency in Hz.
    pub bandwidth: f64,
}

/// Result of fitting the lower bandwidth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowerBandwidthFit {
    pub rl: DacFit,
    pub dac3: bool,
    /// Achieved corner frequency in Hz.
    pub bandwidth: f64,
}

pub fn rh1_from_upper_bandwidth(upper_bandwidth: f64) -> f64 {
    let x = upper_bandwidth.log10();
    0.9730 * 10f64.powf(8.0968 - 1.1892 * x + 0.04767 * x * x)
}

pub fn rh2_from_upper_bandwidth(upper_bandwidth: f64) -> f64 {
    let x = upper_bandwidth.log10();
    1.0191 * 10f64.powf(8.1009 - 1.0821 * x + 0.03383 * x * x)
}

pub fn rl_from_lower_bandwidth(lower_bandwidth: f64) -> f64 {
    let x = lower_bandwidth.log10();
    if lower_bandwidth < 4.0 {
        1.0061 * 10f64.powf(4.9391 - 1.2088 * x + 0.5698 * x * x + 0.1442 * x * x * x)
    } else {
        1.0061 * 10f64.powf(4.7351 - 0.5916 * x + 0.08482 * x * x)
    }
}

// Smaller root of a·x² + b·x + c = 0, as a power of ten.
fn inverse_log_quadratic(a: f64, b: f64, c: f64) -> f64 {
    10f64.powf((-b - (b * b - 4.0 * a * c).sqrt()) / (2.0 * a))
}

pub fn upper_bandwidth_from_rh1(rh1: f64) -> f64 {
    inverse_log_quadratic(0.04767, -1.1892, 8.0968 - (rh1 / 0.9730).log10())
}

pub fn upper_bandwidth_from_rh2(rh2: f64) -> f64 {
    inverse_log_quadratic(0.03383, -1.0821, 8.1009 - (rh2 / 1.0191).log10())
}

/// Inverse RL fit.
///
/// The fit is invalid below 5.1 kΩ, so the resistance is floored there. The
/// two regimes meet at 30 kΩ without smoothing; that step is part of the
/// empirical calibration.
pub fn lower_bandwidth_from_rl(rl: f64) -> f64 {
    let rl = rl.max(5100.0);
    if rl < 30000.0 {
        inverse_log_quadratic(0.08482, -0.5916, 4.7351 - (rl / 1.0061).log10())
    } else {
        inverse_log_quadratic(0.3303, -1.2100, 4.9391 - (rl / 1.0061).log10())
    }
}

/// Picks RH1/RH2 DAC codes for a requested upper bandwidth.
pub fn fit_upper_bandwidth(upper_bandwidth: f64) -> UpperBandwidthFit {
    let upper_bandwidth = upper_bandwidth.min(MAX_UPPER_BANDWIDTH);

    let rh1 = RH1.fit_from(RH1.base, rh1_from_upper_bandwidth(upper_bandwidth));
    let rh2 = RH2.fit_from(RH2.base, rh2_from_upper_bandwidth(upper_bandwidth));

    // Both estimates should be very close; combine them.
    let bandwidth = (upper_bandwidth_from_rh1(rh1.resistance)
        * upper_bandwidth_from_rh2(rh2.resistance))
    .sqrt();

    UpperBandwidthFit {
        rh1,
        rh2,
        bandwidth,
    }
}

/// Picks RL DAC codes for a requested lower bandwidth.
pub fn fit_lower_bandwidth(lower_bandwidth: f64) -> LowerBandwidthFit {
    let lower_bandwidth = lower_bandwidth.min(MAX_LOWER_BANDWIDTH);
    let target = rl_from_lower_bandwidth(lower_bandwidth);

    let dac3 = lower_bandwidth < RL_DAC3_THRESHOLD;
    let start = if dac3 { RL.base + RL_DAC3_UNIT } else { RL.base };
    let rl = RL.fit_from(start, target);

    LowerBandwidthFit {
        rl,
        dac3,
        bandwidth: lower_bandwidth_from_rl(rl.resistance),
    }
}

/// DSP high-pass corner for cutoff code `n` (1..=15) at `sample_rate`.
pub fn dsp_cutoff_for_code(n: u8, sample_rate: f64) -> f64 {
    let x = 2f64.powi(n as i32);
    sample_rate * (x / (x - 1.0)).ln() / (2.0 * PI)
}

/// Chooses the DSP cutoff code closest to `target` on a log scale.
///
/// Targets above the code-1 corner clamp to code 1 and targets below the
/// code-15 corner clamp to code 15. Returns the code and the corner it
/// actually realizes.
pub fn select_dsp_cutoff(target: f64, sample_rate: f64) -> (u8, f64) {
    let ladder: Vec<f64> = (1..=DSP_CUTOFF_CODES)
        .map(|n| dsp_cutoff_for_code(n, sample_rate))
        .collect();

    let code = if target > ladder[0] {
        1
    } else if target < ladder[ladder.len() - 1] {
        DSP_CUTOFF_CODES
    } else {
        let log_target = target.log10();
        let mut best = 1;
        let mut min_diff = f64::MAX;
        for (i, f) in ladder.iter().enumerate() {
            let diff = (log_target - f.log10()).abs();
            if diff < min_diff {
                min_diff = diff;
                best = i as u8 + 1;
            }
        }
        best
    };

    (code, ladder[code as usize - 1])
}
