use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure};
use clap::{ArgAction, Parser, ValueEnum};
use devio_protocol::layout::{DEFAULT_BUFFER_SIZE, DEFAULT_SHM_DIR};
use devio_server::{ServerConfig, ShmConfig, TcpConfig, TransportConfig};
use devio_storage::SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Tcp,
    Shm,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "devio-serve",
    version,
    about = "Serve a disk image to a block-device client over TCP or shared memory."
)]
pub struct Args {
    /// Disk image file to serve.
    ///
    /// Environment variable: `DEVIO_IMAGE`.
    #[arg(long, env = "DEVIO_IMAGE", value_name = "PATH")]
    image: Option<PathBuf>,

    /// Serve a zero-filled in-memory disk of this many bytes instead of an image.
    ///
    /// Environment variable: `DEVIO_RAM_DISK_SIZE`.
    #[arg(long, env = "DEVIO_RAM_DISK_SIZE", value_name = "BYTES")]
    ram_disk_size: Option<u64>,

    /// Serve a read-only disk of this many zero bytes with no backing store.
    ///
    /// Environment variable: `DEVIO_ZERO_DISK_SIZE`.
    #[arg(long, env = "DEVIO_ZERO_DISK_SIZE", value_name = "BYTES")]
    zero_disk_size: Option<u64>,

    /// Start of the served window within the image.
    #[arg(long, env = "DEVIO_OFFSET", value_name = "BYTES", default_value_t = 0)]
    offset: u64,

    /// Length of the served window (defaults to the rest of the image).
    #[arg(long, env = "DEVIO_LENGTH", value_name = "BYTES")]
    length: Option<u64>,

    /// Alignment of all I/O issued against the image (power of two).
    #[arg(long, env = "DEVIO_ALIGNMENT", value_name = "BYTES", default_value_t = SECTOR_SIZE)]
    alignment: u32,

    /// Grow the image in steps of `mask + 1` bytes on writes past its end (0 disables growth).
    #[arg(long, env = "DEVIO_GROW_INTERVAL", value_name = "MASK", default_value_t = 0)]
    grow_interval: u64,

    #[arg(long, env = "DEVIO_READ_ONLY", action = ArgAction::SetTrue)]
    read_only: bool,

    /// Answer SHARED requests with persistent-reservation semantics.
    #[arg(long, env = "DEVIO_SHARED_KEYS", action = ArgAction::SetTrue)]
    shared_keys: bool,

    #[arg(long, env = "DEVIO_TRANSPORT", value_enum, default_value_t = TransportKind::Tcp)]
    transport: TransportKind,

    /// Address the TCP transport listens on.
    #[arg(long, env = "DEVIO_LISTEN", default_value = "127.0.0.1:9000")]
    listen: SocketAddr,

    /// Name of the shared-memory mapping and its semaphores.
    #[arg(long, env = "DEVIO_SHM_NAME", default_value = "devio")]
    shm_name: String,

    /// Directory holding the shared-memory mapping and lock files.
    #[arg(long, env = "DEVIO_SHM_DIR", default_value = DEFAULT_SHM_DIR)]
    shm_dir: PathBuf,

    /// Maximum transfer size (the shared-memory data region size).
    #[arg(
        long,
        env = "DEVIO_BUFFER_SIZE",
        value_name = "BYTES",
        default_value_t = DEFAULT_BUFFER_SIZE
    )]
    buffer_size: usize,

    /// Give up if no client attaches within this many seconds.
    #[arg(long, env = "DEVIO_ACCEPT_TIMEOUT", value_name = "SECS")]
    accept_timeout: Option<u64>,

    /// Log filter (tracing-subscriber EnvFilter syntax). Overrides `RUST_LOG`.
    ///
    /// Environment variable: `DEVIO_LOG_LEVEL`.
    #[arg(long, env = "DEVIO_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "DEVIO_JSON_LOGS", action = ArgAction::SetTrue)]
    json_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    Image(PathBuf),
    Ram(u64),
    Zero(u64),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: DiskSource,
    pub offset: u64,
    pub length: Option<u64>,
    pub alignment: u32,
    pub grow_interval: u64,
    pub read_only: bool,
    pub shared_keys: bool,
    pub server: ServerConfig,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let source = match (args.image, args.ram_disk_size, args.zero_disk_size) {
            (Some(path), None, None) => DiskSource::Image(path),
            (None, Some(size), None) => DiskSource::Ram(size),
            (None, None, Some(size)) => DiskSource::Zero(size),
            (None, None, None) => {
                bail!("one of --image, --ram-disk-size or --zero-disk-size is required")
            }
            _ => bail!("--image, --ram-disk-size and --zero-disk-size are mutually exclusive"),
        };
        ensure!(args.buffer_size > 0, "--buffer-size must be non-zero");

        let transport = match args.transport {
            TransportKind::Tcp => TransportConfig::Tcp(TcpConfig {
                listen: args.listen,
                max_transfer_size: args.buffer_size,
            }),
            TransportKind::Shm => TransportConfig::Shm(ShmConfig {
                name: args.shm_name,
                dir: args.shm_dir,
                buffer_size: args.buffer_size,
            }),
        };

        let log_level = args.log_level.and_then(|v| {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        });

        Ok(Self {
            source,
            offset: args.offset,
            length: args.length,
            alignment: args.alignment,
            grow_interval: args.grow_interval,
            read_only: args.read_only,
            shared_keys: args.shared_keys,
            server: ServerConfig {
                transport,
                accept_timeout: args.accept_timeout.map(Duration::from_secs),
            },
            log_level,
            json_logs: args.json_logs,
        })
    }
}
