use crate::{RegisterImage, UsbGeneration, ZcheckScale};
use confique::Config;
use log::info;
use std::path::PathBuf;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub amplifier_settings: AmplifierSettings,
    #[config(nested)]
    pub impedance_settings: ImpedanceSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = "data", env = "RHD_OUTPUT_DIR")]
    pub output_dir: PathBuf,
    #[config(default = 0)]
    pub campaign_num: usize,
    /// Per-channel sample rate in Hz.
    #[config(default = 30000.0)]
    pub sample_rate: f64,
    #[config(default = 1)]
    pub num_streams: usize,
    #[config(default = "legacy")]
    pub usb_generation: UsbGeneration,
    #[config(default = 1)]
    pub blocks_per_read: usize,
}

#[derive(Config, Debug, Clone)]
pub struct AmplifierSettings {
    #[config(default = 7500.0)]
    pub upper_bandwidth: f64,
    #[config(default = 1.0)]
    pub lower_bandwidth: f64,
    #[config(default = true)]
    pub dsp_enabled: bool,
    #[config(default = 1.0)]
    pub dsp_cutoff: f64,
    #[config(default = true)]
    pub calibrate: bool,
}

#[derive(Config, Debug, Clone)]
pub struct ImpedanceSettings {
    #[config(default = 1000.0)]
    pub frequency: f64,
    #[config(default = 128.0)]
    pub amplitude: f64,
    #[config(default = 0)]
    pub channel: i32,
    #[config(default = "100fF")]
    pub scale: ZcheckScale,
}

/// Bandwidths the chip will actually realize for the requested settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AchievedBandwidth {
    pub upper: f64,
    pub lower: f64,
    pub dsp_cutoff: f64,
}

impl AmplifierSettings {
    pub fn apply(&self, regs: &mut RegisterImage) -> AchievedBandwidth {
        let upper = regs.set_upper_bandwidth(self.upper_bandwidth);
        let lower = regs.set_lower_bandwidth(self.lower_bandwidth);
        regs.enable_dsp(self.dsp_enabled);
        let dsp_cutoff = regs.set_dsp_cutoff_freq(self.dsp_cutoff);
        info!(
            "Amplifier bandwidth {:.2} Hz - {:.1} Hz (requested {} - {}), DSP cutoff {:.3} Hz{}",
            lower,
            upper,
            self.lower_bandwidth,
            self.upper_bandwidth,
            dsp_cutoff,
            if self.dsp_enabled { "" } else { " (disabled)" }
        );
        AchievedBandwidth {
            upper,
            lower,
            dsp_cutoff,
        }
    }
}

impl Conf {
    /// Register image for the configured sample rate and amplifier settings.
    pub fn register_image(&self) -> anyhow::Result<RegisterImage> {
        let mut regs = RegisterImage::new(self.run_settings.sample_rate);
        self.amplifier_settings.apply(&mut regs);
        regs.set_zcheck_scale(self.impedance_settings.scale);
        regs.set_zcheck_channel(self.impedance_settings.channel)?;
        Ok(regs)
    }
}
