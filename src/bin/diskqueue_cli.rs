use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use diskqueue::{Queue, QueueConfig, QueueReader};
use log::info;

#[derive(Parser)]
#[command(name = "diskqueue-cli", version, about = "Disk queue tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append payloads and print their offsets.
    Put {
        queue_path: PathBuf,
        #[arg(long = "config")]
        config: Option<PathBuf>,
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Print records starting at an offset.
    Read {
        queue_path: PathBuf,
        #[arg(long = "offset", default_value_t = 0)]
        offset: u64,
        #[arg(long = "count", default_value_t = 1)]
        count: usize,
        #[arg(long = "hexdump")]
        hexdump: bool,
    },
    /// Print the segment table as JSON.
    Stat { queue_path: PathBuf },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Put {
            queue_path,
            config,
            payloads,
        } => cmd_put(&queue_path, config.as_deref(), &payloads, &mut out)?,
        Commands::Read {
            queue_path,
            offset,
            count,
            hexdump,
        } => cmd_read(&queue_path, offset, count, hexdump, &mut out)?,
        Commands::Stat { queue_path } => cmd_stat(&queue_path, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn load_config(queue_path: &Path, config: Option<&Path>) -> Result<QueueConfig, Box<dyn Error>> {
    let mut config = match config {
        Some(path) => QueueConfig::from_json_file(path)?,
        None => QueueConfig::default(),
    };
    config.directory = queue_path.to_path_buf();
    Ok(config)
}

fn cmd_put(
    queue_path: &Path,
    config: Option<&Path>,
    payloads: &[String],
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let queue = Queue::open(load_config(queue_path, config)?)?;
    for payload in payloads {
        let offset = queue.put(payload.as_bytes())?;
        writeln!(out, "{offset}")?;
    }
    queue.close()?;
    info!("appended {} record(s)", payloads.len());
    Ok(())
}

fn cmd_read(
    queue_path: &Path,
    offset: u64,
    count: usize,
    hexdump: bool,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let reader = QueueReader::open(queue_path)?;
    let records = reader.read(offset, vec![Vec::new(); count.max(1)])?;
    let mut at = offset;
    for record in &records {
        if hexdump {
            writeln!(out, "{at}\t{}", hex(record))?;
        } else {
            writeln!(out, "{at}\t{}", String::from_utf8_lossy(record))?;
        }
        at += 4 + record.len() as u64;
    }
    Ok(())
}

fn cmd_stat(queue_path: &Path, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let reader = QueueReader::open(queue_path)?;
    let stat = serde_json::json!({
        "directory": reader.directory(),
        "end_offset": reader.end_offset()?,
        "segments": reader.segment_metas()?,
    });
    serde_json::to_writer_pretty(&mut *out, &stat)?;
    writeln!(out)?;
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
