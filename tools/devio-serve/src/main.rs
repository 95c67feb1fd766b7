mod config;

use anyhow::Context;
use devio_server::{
    Provider, Server, SharedKeysProvider, StreamProvider, TransportConfig, ZeroProvider,
};
use devio_storage::{AligningStream, FileStream, MemStream, Stream, SubStream};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DiskSource};

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;
    run(config)
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.json_logs {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
    Ok(())
}

fn run(config: Config) -> anyhow::Result<()> {
    let provider = open_provider(&config)?;
    let length = provider.length().context("query disk length")?;
    match &config.server.transport {
        TransportConfig::Tcp(tcp) => {
            tracing::info!("serving {length} bytes on tcp://{}", tcp.listen)
        }
        TransportConfig::Shm(shm) => {
            tracing::info!("serving {length} bytes on shared memory {:?}", shm.name)
        }
    }

    let mut server = Server::new(provider, config.server.clone());
    server.run().context("server terminated")?;
    Ok(())
}

fn open_provider(config: &Config) -> anyhow::Result<Box<dyn Provider>> {
    let provider = match &config.source {
        DiskSource::Zero(size) => Box::new(ZeroProvider::new(*size)) as Box<dyn Provider>,
        DiskSource::Ram(size) => {
            let mem = MemStream::with_len(*size)
                .with_context(|| format!("allocate {size}-byte RAM disk"))?;
            let mem = if config.read_only {
                mem.read_only()
            } else {
                mem
            };
            stack(mem, config)?
        }
        DiskSource::Image(path) => {
            let file = if config.read_only {
                FileStream::open_read_only(path)
            } else {
                FileStream::open(path)
            }
            .with_context(|| format!("open image {}", path.display()))?;
            stack(file, config)?
        }
    };
    if config.shared_keys {
        return Ok(Box::new(SharedKeysProvider::new(provider)));
    }
    Ok(provider)
}

/// Align the backing store, then optionally narrow it to the configured window.
fn stack<S>(base: S, config: &Config) -> anyhow::Result<Box<dyn Provider>>
where
    S: Stream + Send + 'static,
{
    let aligned = AligningStream::new(base, config.alignment, config.grow_interval)
        .context("configure alignment")?;
    if config.offset == 0 && config.length.is_none() {
        return Ok(Box::new(StreamProvider::new(aligned)));
    }

    let length = match config.length {
        Some(length) => length,
        None => aligned
            .len()?
            .checked_sub(config.offset)
            .context("--offset is beyond the end of the image")?,
    };
    let window = SubStream::new(aligned, config.offset, length)
        .context("--offset/--length do not fit the image")?;
    Ok(Box::new(StreamProvider::new(window)))
}
