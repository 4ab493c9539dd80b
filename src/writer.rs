use crate::{SampleBlock, UsbGeneration};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info};
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Framing parameters of a run file, stored next to it as `<run>.toml`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub sample_rate: f64,
    pub num_streams: usize,
    pub usb_generation: UsbGeneration,
    /// UTC start of the run, RFC 3339.
    pub start_time: String,
}

impl RunInfo {
    pub fn new(
        sample_rate: f64,
        num_streams: usize,
        usb_generation: UsbGeneration,
        start_time: OffsetDateTime,
    ) -> Result<Self> {
        let start_time = start_time
            .format(&Rfc3339)
            .context("failed to format run start time")?;
        Ok(RunInfo {
            sample_rate,
            num_streams,
            usb_generation,
            start_time,
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("failed to serialize run info")
    }

    /// Writes the sidecar for `run_file` and returns its path.
    pub fn write_sidecar(&self, run_file: &Path) -> Result<PathBuf> {
        let path = run_file.with_extension("toml");
        std::fs::write(&path, self.to_toml()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Appends encoded blocks to a flat run file.
pub struct SampleWriter {
    file: BufWriter<File>,
    num_streams: usize,
    scratch: Vec<u8>,
    pub blocks_written: usize,
    pub bytes_written: usize,
}

impl SampleWriter {
    pub fn create(path: &Path, num_streams: usize) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create run file {}", path.display()))?;
        Ok(SampleWriter {
            file: BufWriter::new(file),
            num_streams,
            scratch: Vec::new(),
            blocks_written: 0,
            bytes_written: 0,
        })
    }

    /// Encodes and appends one block, returning its size in bytes.
    pub fn append(&mut self, block: &SampleBlock) -> Result<usize> {
        self.scratch.clear();
        block.encode_into(self.num_streams, &mut self.scratch)?;
        self.file.write_all(&self.scratch)?;
        self.blocks_written += 1;
        self.bytes_written += self.scratch.len();
        Ok(self.scratch.len())
    }

    pub fn finish(mut self) -> Result<(usize, usize)> {
        self.file.flush().context("failed to flush run file")?;
        Ok((self.blocks_written, self.bytes_written))
    }
}

/// Writer thread body: appends every received block to `run_file` and
/// reports `(bytes, queue length)` per block on `tx_stats`.
///
/// Returns `(blocks, bytes)` written once the sending side disconnects.
pub fn write_blocks(
    rx: Receiver<SampleBlock>,
    tx_stats: Sender<(usize, usize)>,
    run_file: PathBuf,
    num_streams: usize,
) -> Result<(usize, usize)> {
    let mut writer = SampleWriter::create(&run_file, num_streams)?;
    info!("Writing run file {}", run_file.display());
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(block) => {
                let size = writer.append(&block)?;
                // stats are best effort; the receiver may already be gone
                let _ = tx_stats.send((size, rx.len()));
            }
            Err(RecvTimeoutError::Timeout) => debug!("Writer idle"),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(tx_stats);
    let (blocks, bytes) = writer.finish()?;
    info!("Closed {} after {blocks} blocks ({bytes} bytes)", run_file.display());
    Ok((blocks, bytes))
}
