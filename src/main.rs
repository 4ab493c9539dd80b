use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use confique::Config;
use crossbeam_channel::{tick, unbounded, TryRecvError};
use log::{error, info, LevelFilter};
use rhd_daq::{
    create_run_file, format_command_list, run_acquisition, write_blocks, Board, Conf, Counter,
    ReplayTransport, RunInfo, NUM_RAM_REGISTERS,
};
use simplelog::{ColorChoice, CombinedLogger, TermLogger, TerminalMode, WriteLogger};
use std::{
    fs::File,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
    time::Duration,
};
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(version, about = "RHD2000 evaluation board data acquisition")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log debug output to the terminal
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a generated command list
    Commands {
        #[arg(short, long, value_enum, default_value_t = ListKind::Config)]
        list: ListKind,
    },
    /// Print the RAM register values for the configured chip
    Registers,
    /// Replay a raw USB capture into a run file
    Convert { capture: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListKind {
    Config,
    Temp,
    Digout,
    Zcheck,
}

fn init_logging(verbose: bool) -> Result<()> {
    let term_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    CombinedLogger::init(vec![
        TermLogger::new(
            term_level,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Debug,
            simplelog::Config::default(),
            File::create("rhd_daq.log").context("failed to create log file")?,
        ),
    ])
    .context("failed to initialize logging")
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose) {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
    if let Err(e) = run(args) {
        error!("{e:?}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Conf::builder()
        .env()
        .file(&args.config)
        .load()
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    match args.command {
        Command::Commands { list } => print_command_list(&config, list),
        Command::Registers => {
            let regs = config.register_image()?;
            for reg in 0..NUM_RAM_REGISTERS as i32 {
                let value = regs.register_value(reg);
                println!("register[{reg:2}] = 0x{value:02x} ({value:08b})");
            }
            Ok(())
        }
        Command::Convert { capture } => convert(&config, capture),
    }
}

fn print_command_list(config: &Conf, kind: ListKind) -> Result<()> {
    let mut regs = config.register_image()?;
    let list = match kind {
        ListKind::Config => regs.configuration_command_list(config.amplifier_settings.calibrate)?,
        ListKind::Temp => regs.temperature_sensor_command_list()?,
        ListKind::Digout => regs.digital_output_command_list()?,
        ListKind::Zcheck => regs.zcheck_dac_command_list(
            config.impedance_settings.frequency,
            config.impedance_settings.amplitude,
        )?,
    };
    print!("{}", format_command_list(&list));
    info!("{kind:?} list: {} commands", list.len());
    Ok(())
}

fn convert(config: &Conf, capture: PathBuf) -> Result<()> {
    let run = &config.run_settings;
    let board = Board::new(
        ReplayTransport::open(&capture)?,
        run.num_streams,
        run.usb_generation,
    )?;

    let (run_file, run_num) = create_run_file(&run.output_dir, run.campaign_num)?;
    RunInfo::new(
        run.sample_rate,
        run.num_streams,
        run.usb_generation,
        OffsetDateTime::now_utc(),
    )?
    .write_sidecar(&run_file)?;
    info!(
        "Campaign {} run {}: converting {}",
        run.campaign_num,
        run_num,
        capture.display()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx_blocks, rx_blocks) = unbounded();
    let (tx_stats, rx_stats) = unbounded();

    let mut counter = Counter::new();
    let num_streams = run.num_streams;
    let writer_handle =
        thread::spawn(move || write_blocks(rx_blocks, tx_stats, run_file, num_streams));
    let blocks_per_read = run.blocks_per_read;
    let acq_handle = thread::spawn(move || {
        let mut board = board;
        run_acquisition(&mut board, blocks_per_read, tx_blocks, shutdown)
    });

    let ticker = tick(Duration::from_secs(1));
    let mut max_queue = 0;
    let mut writer_done = false;
    while !writer_done {
        let _ = ticker.recv();
        loop {
            match rx_stats.try_recv() {
                Ok((size, queue_len)) => {
                    counter.increment(size);
                    max_queue = max_queue.max(queue_len);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    writer_done = true;
                    break;
                }
            }
        }
        let rate = counter.rate();
        info!(
            "{} blocks, {:.2} MB/s, queue {}",
            counter.n_blocks,
            rate,
            max_queue
        );
    }

    let acq = acq_handle
        .join()
        .map_err(|_| anyhow::anyhow!("acquisition thread panicked"))?;
    let written = writer_handle
        .join()
        .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
    let acq = acq?;

    println!(
        "Blocks: {} read, {} written ({} bytes), {} sync errors",
        acq.blocks, written.0, written.1, acq.sync_errors
    );
    println!(
        "Average rate: {:.2} MB/s, peak queue length: {}",
        counter.average_rate(),
        max_queue
    );
    Ok(())
}
