//! Logical configuration state of one RHD2000 chip.
//!
//! [`RegisterImage`] holds the named settings; the 18 physical RAM register
//! bytes are derived on demand by [`RegisterImage::register_value`].

use crate::bandwidth;
use crate::error::{Result, RhdError};
use serde::Deserialize;

/// Amplifier channels addressable on one chip.
pub const MAX_NUM_CHANNELS: usize = 64;

/// Number of RAM registers programmed by the configuration command list.
pub const NUM_RAM_REGISTERS: usize = 18;

/// Register 6 value for a DC (midrange) impedance-check DAC output.
pub const ZCHECK_DAC_MIDRANGE: i32 = 128;

/// Capacitor used to inject the impedance-check current.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum ZcheckScale {
    #[serde(rename = "100fF")]
    Cs100fF,
    #[serde(rename = "1pF")]
    Cs1pF,
    #[serde(rename = "10pF")]
    Cs10pF,
}

/// Which amplifier input the impedance test drives (RHD2216 only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZcheckPolarity {
    PositiveInput,
    NegativeInput,
}

/// State of the chip's auxiliary digital output pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigOut {
    Low,
    High,
    HiZ,
}

/// Bias currents that must track the ADC sampling rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdcBias {
    pub mux_bias: u8,
    pub adc_buffer_bias: u8,
}

/// Looks up the mux and ADC buffer bias for a per-channel sample rate.
pub fn adc_bias_for_sample_rate(sample_rate: f64) -> AdcBias {
    let (mux_bias, adc_buffer_bias) = if sample_rate < 3334.0 {
        (40, 32)
    } else if sample_rate < 4001.0 {
        (40, 16)
    } else if sample_rate < 5001.0 {
        (40, 8)
    } else if sample_rate < 6251.0 {
        (32, 8)
    } else if sample_rate < 8001.0 {
        (26, 8)
    } else if sample_rate < 10001.0 {
        (18, 4)
    } else if sample_rate < 12501.0 {
        (16, 3)
    } else if sample_rate < 15001.0 {
        (7, 3)
    } else {
        (4, 2)
    };
    AdcBias {
        mux_bias,
        adc_buffer_bias,
    }
}

/// Logical register state of one chip.
///
/// Not synchronized: one instance belongs to the context that configures the
/// chip. Command lists read it; only the temperature sensor list writes
/// back, to leave the sensor enabled.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterImage {
    sample_rate: f64,

    // register 0
    adc_reference_bw: u8,
    amp_fast_settle: u8,
    amp_vref_enable: u8,
    adc_comparator_bias: u8,
    adc_comparator_select: u8,

    // registers 1-2
    vdd_sense_enable: u8,
    adc_buffer_bias: u8,
    mux_bias: u8,

    // register 3
    mux_load: u8,
    pub(crate) temp_s1: u8,
    pub(crate) temp_s2: u8,
    temp_en: u8,
    dig_out_hiz: u8,
    dig_out: u8,

    // register 4
    weak_miso: u8,
    twos_comp: u8,
    abs_mode: u8,
    dsp_en: u8,
    dsp_cutoff_freq: u8,

    // register 5
    zcheck_dac_power: u8,
    zcheck_load: u8,
    zcheck_scale: u8,
    zcheck_conn_all: u8,
    zcheck_sel_pol: u8,
    zcheck_en: u8,

    // register 7
    zcheck_select: u8,

    // registers 8-13
    off_chip_rh1: u8,
    off_chip_rh2: u8,
    off_chip_rl: u8,
    adc_aux1_en: u8,
    adc_aux2_en: u8,
    adc_aux3_en: u8,
    rh1_dac1: u8,
    rh1_dac2: u8,
    rh2_dac1: u8,
    rh2_dac2: u8,
    rl_dac1: u8,
    rl_dac2: u8,
    rl_dac3: u8,

    // registers 14-17
    a_pwr: [u8; MAX_NUM_CHANNELS],
}

impl RegisterImage {
    /// Creates the power-on configuration for a chip sampled at `sample_rate`.
    pub fn new(sample_rate: f64) -> Self {
        let mut regs = RegisterImage {
            sample_rate,
            adc_reference_bw: 3,
            amp_fast_settle: 0,
            amp_vref_enable: 1,
            adc_comparator_bias: 3,
            adc_comparator_select: 2,
            vdd_sense_enable: 1,
            adc_buffer_bias: 0,
            mux_bias: 0,
            mux_load: 0,
            temp_s1: 0,
            temp_s2: 0,
            temp_en: 0,
            dig_out_hiz: 0,
            dig_out: 0,
            weak_miso: 1,
            twos_comp: 0,
            abs_mode: 0,
            dsp_en: 0,
            dsp_cutoff_freq: 0,
            zcheck_dac_power: 1,
            zcheck_load: 0,
            zcheck_scale: 0,
            zcheck_conn_all: 0,
            zcheck_sel_pol: 0,
            zcheck_en: 0,
            zcheck_select: 0,
            off_chip_rh1: 0,
            off_chip_rh2: 0,
            off_chip_rl: 0,
            adc_aux1_en: 1,
            adc_aux2_en: 1,
            adc_aux3_en: 1,
            rh1_dac1: 0,
            rh1_dac2: 0,
            rh2_dac1: 0,
            rh2_dac2: 0,
            rl_dac1: 0,
            rl_dac2: 0,
            rl_dac3: 0,
            a_pwr: [0; MAX_NUM_CHANNELS],
        };
        regs.define_sample_rate(sample_rate);
        regs.set_dig_out(DigOut::HiZ);
        regs.enable_dsp(true);
        regs.set_dsp_cutoff_freq(1.0);
        regs.set_zcheck_scale(ZcheckScale::Cs100fF);
        regs.set_zcheck_polarity(ZcheckPolarity::PositiveInput);
        regs.set_upper_bandwidth(10000.0);
        regs.set_lower_bandwidth(1.0);
        regs.power_up_all_amps();
        regs
    }

    /// Sets the per-channel sample rate and the ADC biases that depend on it.
    ///
    /// Only the bias currents follow the new rate. The DSP cutoff code and
    /// impedance waveforms are rate-relative, so callers must re-run
    /// [`set_dsp_cutoff_freq`](Self::set_dsp_cutoff_freq) and regenerate the
    /// impedance DAC list after changing the rate.
    pub fn define_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        let bias = adc_bias_for_sample_rate(sample_rate);
        self.mux_bias = bias.mux_bias;
        self.adc_buffer_bias = bias.adc_buffer_bias;
        self.mux_load = 0;
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn adc_bias(&self) -> AdcBias {
        AdcBias {
            mux_bias: self.mux_bias,
            adc_buffer_bias: self.adc_buffer_bias,
        }
    }

    pub fn set_fast_settle(&mut self, enabled: bool) {
        self.amp_fast_settle = enabled as u8;
    }

    pub fn set_dig_out(&mut self, state: DigOut) {
        (self.dig_out, self.dig_out_hiz) = match state {
            DigOut::Low => (0, 0),
            DigOut::High => (1, 0),
            DigOut::HiZ => (0, 1),
        };
    }

    pub fn enable_aux1(&mut self, enabled: bool) {
        self.adc_aux1_en = enabled as u8;
    }

    pub fn enable_aux2(&mut self, enabled: bool) {
        self.adc_aux2_en = enabled as u8;
    }

    pub fn enable_aux3(&mut self, enabled: bool) {
        self.adc_aux3_en = enabled as u8;
    }

    /// Powers the on-chip temperature sensor (register 3 bit 2).
    pub fn enable_temp_sensor(&mut self, enabled: bool) {
        self.temp_en = enabled as u8;
    }

    pub fn enable_dsp(&mut self, enabled: bool) {
        self.dsp_en = enabled as u8;
    }

    /// Selects the DSP offset-removal cutoff nearest `target` and returns the
    /// frequency actually realized, which callers should treat as the truth.
    pub fn set_dsp_cutoff_freq(&mut self, target: f64) -> f64 {
        let (code, achieved) = bandwidth::select_dsp_cutoff(target, self.sample_rate);
        self.dsp_cutoff_freq = code;
        achieved
    }

    /// Realized DSP cutoff for the current code and sample rate.
    pub fn dsp_cutoff_freq(&self) -> f64 {
        bandwidth::dsp_cutoff_for_code(self.dsp_cutoff_freq, self.sample_rate)
    }

    pub fn set_zcheck_dac_power(&mut self, enabled: bool) {
        self.zcheck_dac_power = enabled as u8;
    }

    pub fn set_zcheck_load(&mut self, enabled: bool) {
        self.zcheck_load = enabled as u8;
    }

    pub fn set_zcheck_scale(&mut self, scale: ZcheckScale) {
        self.zcheck_scale = match scale {
            ZcheckScale::Cs100fF => 0,
            ZcheckScale::Cs1pF => 1,
            ZcheckScale::Cs10pF => 3,
        };
    }

    pub fn set_zcheck_conn_all(&mut self, enabled: bool) {
        self.zcheck_conn_all = enabled as u8;
    }

    pub fn set_zcheck_polarity(&mut self, polarity: ZcheckPolarity) {
        self.zcheck_sel_pol = match polarity {
            ZcheckPolarity::PositiveInput => 0,
            ZcheckPolarity::NegativeInput => 1,
        };
    }

    pub fn enable_zcheck(&mut self, enabled: bool) {
        self.zcheck_en = enabled as u8;
    }

    /// Routes the impedance-check DAC to amplifier `channel` (0-63).
    pub fn set_zcheck_channel(&mut self, channel: i32) -> Result<()> {
        if !(0..MAX_NUM_CHANNELS as i32).contains(&channel) {
            return Err(RhdError::out_of_range("channel", channel));
        }
        self.zcheck_select = channel as u8;
        Ok(())
    }

    pub fn set_amp_powered(&mut self, channel: i32, powered: bool) -> Result<()> {
        if !(0..MAX_NUM_CHANNELS as i32).contains(&channel) {
            return Err(RhdError::out_of_range("channel", channel));
        }
        self.a_pwr[channel as usize] = powered as u8;
        Ok(())
    }

    pub fn power_up_all_amps(&mut self) {
        self.a_pwr = [1; MAX_NUM_CHANNELS];
    }

    pub fn power_down_all_amps(&mut self) {
        self.a_pwr = [0; MAX_NUM_CHANNELS];
    }

    /// Programs RH1/RH2 for `target` Hz (clamped to 30 kHz) and returns the
    /// bandwidth the chosen DAC codes actually realize.
    pub fn set_upper_bandwidth(&mut self, target: f64) -> f64 {
        let fit = bandwidth::fit_upper_bandwidth(target);
        self.rh1_dac1 = fit.rh1.dac1;
        self.rh1_dac2 = fit.rh1.dac2;
        self.rh2_dac1 = fit.rh2.dac1;
        self.rh2_dac2 = fit.rh2.dac2;
        fit.bandwidth
    }

    /// Programs RL for `target` Hz (clamped to 1.5 kHz) and returns the
    /// bandwidth the chosen DAC codes actually realize.
    pub fn set_lower_bandwidth(&mut self, target: f64) -> f64 {
        let fit = bandwidth::fit_lower_bandwidth(target);
        self.rl_dac1 = fit.rl.dac1;
        self.rl_dac2 = fit.rl.dac2;
        self.rl_dac3 = fit.dac3 as u8;
        fit.bandwidth
    }

    /// Current RH1/RH2 codes as `(rh1_dac1, rh1_dac2, rh2_dac1, rh2_dac2)`.
    pub fn upper_bandwidth_dacs(&self) -> (u8, u8, u8, u8) {
        (self.rh1_dac1, self.rh1_dac2, self.rh2_dac1, self.rh2_dac2)
    }

    /// Current RL codes as `(rl_dac1, rl_dac2, rl_dac3)`.
    pub fn lower_bandwidth_dacs(&self) -> (u8, u8, u8) {
        (self.rl_dac1, self.rl_dac2, self.rl_dac3)
    }

    /// Physical value of RAM register `reg` (0-17), or -1 for any other index.
    ///
    /// Register 6 always reads as the DAC midrange; the real impedance-check
    /// waveform is produced by its own command list.
    pub fn register_value(&self, reg: i32) -> i32 {
        let v = |x: u8| x as i32;
        match reg {
            0 => {
                (v(self.adc_reference_bw) << 6)
                    | (v(self.amp_fast_settle) << 5)
                    | (v(self.amp_vref_enable) << 4)
                    | (v(self.adc_comparator_bias) << 2)
                    | v(self.adc_comparator_select)
            }
            1 => (v(self.vdd_sense_enable) << 6) | v(self.adc_buffer_bias),
            2 => v(self.mux_bias),
            3 => {
                (v(self.mux_load) << 5)
                    | (v(self.temp_s2) << 4)
                    | (v(self.temp_s1) << 3)
                    | (v(self.temp_en) << 2)
                    | (v(self.dig_out_hiz) << 1)
                    | v(self.dig_out)
            }
            4 => {
                (v(self.weak_miso) << 7)
                    | (v(self.twos_comp) << 6)
                    | (v(self.abs_mode) << 5)
                    | (v(self.dsp_en) << 4)
                    | v(self.dsp_cutoff_freq)
            }
            5 => {
                (v(self.zcheck_dac_power) << 6)
                    | (v(self.zcheck_load) << 5)
                    | (v(self.zcheck_scale) << 3)
                    | (v(self.zcheck_conn_all) << 2)
                    | (v(self.zcheck_sel_pol) << 1)
                    | v(self.zcheck_en)
            }
            6 => ZCHECK_DAC_MIDRANGE,
            7 => v(self.zcheck_select),
            8 => (v(self.off_chip_rh1) << 7) | v(self.rh1_dac1),
            9 => (v(self.adc_aux1_en) << 7) | v(self.rh1_dac2),
            10 => (v(self.off_chip_rh2) << 7) | v(self.rh2_dac1),
            11 => (v(self.adc_aux2_en) << 7) | v(self.rh2_dac2),
            12 => (v(self.off_chip_rl) << 7) | v(self.rl_dac1),
            13 => (v(self.adc_aux3_en) << 7) | (v(self.rl_dac3) << 6) | v(self.rl_dac2),
            // register 15 bit 0 is channel 8; pending confirmation on hardware
            14..=17 => {
                let first = (reg as usize - 14) * 8;
                self.a_pwr[first..first + 8]
                    .iter()
                    .enumerate()
                    .fold(0, |acc, (bit, &on)| acc | (v(on) << bit))
            }
            _ => -1,
        }
    }

    /// All RAM register values, registers 0 through 17.
    pub fn register_values(&self) -> [u8; NUM_RAM_REGISTERS] {
        let mut out = [0u8; NUM_RAM_REGISTERS];
        for (reg, value) in out.iter_mut().enumerate() {
            *value = self.register_value(reg as i32) as u8;
        }
        out
    }
}
