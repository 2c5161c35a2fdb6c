//! Command-line front end: open a port, optionally send a string or a file,
//! and print everything received until Enter is pressed.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{never, select, unbounded, Receiver};
use parking_lot::Mutex;
use serlisten_core::{
    write_bytes, write_file, CallbackRegistry, LineAssembler, Listener, ListenerEvent,
    SerialChannel, SerialConfig, SerialPortChannel, TextEncoding,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod settings;

use settings::{LineEnding, Settings};

#[derive(Parser, Debug)]
#[command(name = "serlisten")]
#[command(about = "Listen to a serial port and write strings or files to it", long_about = None)]
#[command(version)]
struct Args {
    /// Port to open (e.g. COM7 or /dev/ttyUSB0)
    port: Option<String>,

    #[arg(short, long)]
    baud: Option<u32>,

    /// Text to write once the listener is running
    #[arg(short, long, value_name = "TEXT")]
    send: Option<String>,

    /// Appended to --send text
    #[arg(long, value_enum)]
    line_ending: Option<LineEnding>,

    /// ASCII file to write to the port
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Bytes per write when sending a file
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Print received bytes as hex instead of text
    #[arg(long, conflicts_with = "text")]
    hex: bool,

    /// Print received bytes as text, overriding a stored --hex
    #[arg(long)]
    text: bool,

    /// Text encoding of received data (auto, utf-8, utf-16, ascii, gbk)
    #[arg(short, long)]
    encoding: Option<String>,

    /// Stop after this many seconds instead of waiting for Enter
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Settings file (default: <config dir>/serlisten/settings.json)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store the effective settings for next time
    #[arg(long)]
    save: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    log::debug!("serlisten-core v{}", serlisten_core::VERSION);

    let settings_path = args.config.clone().or_else(settings::default_path);
    let stored = settings_path
        .as_deref()
        .map(Settings::load)
        .unwrap_or_default();
    let settings = merge(stored, &args);

    if args.save {
        match &settings_path {
            Some(path) => settings.save(path)?,
            None => log::warn!("no config directory; settings not saved"),
        }
    }

    let Some(port) = settings.port.clone() else {
        bail!("no port given; pass PORT or store one with --save");
    };
    let encoding: TextEncoding = settings
        .encoding
        .parse()
        .map_err(anyhow::Error::msg)?;

    let cfg = SerialConfig {
        baud_rate: settings.baud_rate,
        ..SerialConfig::new(port)
    };
    let channel: Arc<dyn SerialChannel> = Arc::new(SerialPortChannel::open(&cfg)?);

    let registry = Arc::new(CallbackRegistry::new());
    let lines = Arc::new(Mutex::new(LineAssembler::new(encoding)));
    let printer = if settings.hex {
        registry.register(print_hex)?
    } else {
        let lines = lines.clone();
        registry.register(move |byte| {
            if let Some(line) = lines.lock().push(byte) {
                print_text(&line);
            }
        })?
    };

    let listener = Listener::new(registry.clone());
    let events = listener.events();
    let handle = listener.start(channel.clone())?;

    if let Some(text) = &args.send {
        let mut data = text.clone().into_bytes();
        data.extend_from_slice(settings.line_ending.as_bytes());
        let n = write_bytes(channel.as_ref(), &data)?;
        log::info!("wrote {n} byte(s)");
    }

    if let Some(path) = &args.file {
        let n = write_file(channel.as_ref(), path, settings.chunk_size)
            .with_context(|| format!("sending {}", path.display()))?;
        log::info!("wrote {n} byte(s) from {}", path.display());
    }

    let outcome = wait_for_exit(&events, args.duration);

    handle.stop()?;
    registry.unregister(printer);
    if let Some(rest) = lines.lock().flush() {
        print_text(&rest);
    }
    println!();

    outcome
}

fn merge(mut settings: Settings, args: &Args) -> Settings {
    if let Some(port) = &args.port {
        settings.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        settings.baud_rate = baud;
    }
    if let Some(encoding) = &args.encoding {
        settings.encoding = encoding.clone();
    }
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size = chunk_size;
    }
    if let Some(line_ending) = args.line_ending {
        settings.line_ending = line_ending;
    }
    if args.hex {
        settings.hex = true;
    } else if args.text {
        settings.hex = false;
    }
    settings
}

/// Blocks until Enter, the optional deadline, or a listener failure.
fn wait_for_exit(events: &Receiver<ListenerEvent>, duration: Option<u64>) -> Result<()> {
    let deadline = match duration {
        Some(secs) => crossbeam_channel::after(Duration::from_secs(secs)),
        None => never(),
    };
    let enter = match duration {
        Some(_) => never(),
        None => {
            eprintln!("Listening; press Enter to finish...");
            spawn_stdin_watch()
        }
    };

    loop {
        select! {
            recv(enter) -> _ => return Ok(()),
            recv(deadline) -> _ => return Ok(()),
            recv(events) -> event => match event {
                Ok(ListenerEvent::Failed(reason)) => bail!("listener stopped: {reason}"),
                Ok(ListenerEvent::Stopped) | Err(_) => return Ok(()),
                Ok(ListenerEvent::Started) => log::debug!("listener running"),
            },
        }
    }
}

fn spawn_stdin_watch() -> Receiver<()> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = tx.send(());
    });
    rx
}

fn print_hex(byte: u8) {
    let mut out = io::stdout().lock();
    let _ = write!(out, "{} ", hex::encode_upper([byte]));
    let _ = out.flush();
}

fn print_text(text: &str) {
    let mut out = io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
