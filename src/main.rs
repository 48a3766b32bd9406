// main.rs

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{Level, info};

use roomdrop::rdt::metrics::{JsonlMetrics, MetricsSink, NullMetrics};
use roomdrop::rdt::storage::{DirFileStore, DirRooms, RoomDirectory, StaticRooms};
use roomdrop::rdt::{Algorithm, Client, RoomCode, Server, TransferConfig, TransferReport};

/// Room-scoped file transfer over UDP with Tahoe/Reno congestion control.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept uploads and serve downloads
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,

        /// Directory holding one subdirectory per room
        #[arg(long)]
        root: PathBuf,

        /// Rooms to open; without any, every directory under --root is a room
        #[arg(long = "room")]
        rooms: Vec<RoomCode>,

        /// Probability of withholding a DATA segment when serving downloads
        #[arg(long, default_value_t = 0.0)]
        loss: f64,

        /// Append sender metrics as JSON lines to this file
        #[arg(long)]
        metrics: Option<PathBuf>,
    },
    /// Send a local file into a room
    Upload {
        #[arg(short, long)]
        server: SocketAddr,

        #[arg(long)]
        room: RoomCode,

        #[arg(long)]
        file: PathBuf,

        /// Name to store the file under; defaults to the file's own name
        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value_t = Algorithm::Tahoe)]
        algo: Algorithm,

        #[arg(long, default_value_t = 0.0)]
        loss: f64,

        #[arg(long)]
        metrics: Option<PathBuf>,
    },
    /// Fetch a file from a room
    Download {
        #[arg(short, long)]
        server: SocketAddr,

        #[arg(long)]
        room: RoomCode,

        #[arg(long)]
        name: String,

        #[arg(long)]
        out: PathBuf,

        #[arg(long, value_enum, default_value_t = Algorithm::Tahoe)]
        algo: Algorithm,

        #[arg(long)]
        metrics: Option<PathBuf>,
    },
}

async fn open_metrics(path: Option<&Path>) -> anyhow::Result<(Arc<dyn MetricsSink>, Option<JoinHandle<()>>)> {
    match path {
        None => Ok((Arc::new(NullMetrics), None)),
        Some(path) => {
            let (sink, writer) = JsonlMetrics::open(path)
                .await
                .with_context(|| format!("opening metrics file {}", path.display()))?;
            Ok((Arc::new(sink), Some(writer)))
        }
    }
}

/// Drops the last sink handle and waits for buffered records to reach disk
async fn close_metrics(sink: Arc<dyn MetricsSink>, writer: Option<JoinHandle<()>>) {
    drop(sink);
    if let Some(writer) = writer {
        writer.await.ok();
    }
}

fn print_report(what: &str, report: &TransferReport) {
    println!(
        "{what}: {} bytes in {} segments, {:.2}s, {} fast retransmits, {} timeouts{}",
        report.bytes,
        report.segments,
        report.elapsed.as_secs_f64(),
        report.fast_retransmits,
        report.timeouts,
        if report.clean_close { "" } else { " (close not acknowledged)" },
    );
}

async fn serve(
    bind: SocketAddr,
    root: PathBuf,
    rooms: Vec<RoomCode>,
    config: TransferConfig,
    metrics_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&root)
        .await
        .with_context(|| format!("creating {}", root.display()))?;

    let directory: Arc<dyn RoomDirectory> = if rooms.is_empty() {
        Arc::new(DirRooms::new(&root))
    } else {
        for room in &rooms {
            tokio::fs::create_dir_all(root.join(room.as_str())).await?;
        }
        Arc::new(StaticRooms::new(rooms))
    };

    let (metrics, writer) = open_metrics(metrics_path.as_deref()).await?;
    let server = Server::bind(bind, config, directory, Arc::new(DirFileStore::new(&root)), metrics.clone()).await?;
    info!(addr = %server.local_addr(), root = %root.display(), "serving");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await?;
    close_metrics(metrics, writer).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).try_init().ok();

    match cli.mode {
        Mode::Serve { bind, root, rooms, loss, metrics } => {
            let config = TransferConfig::default().with_loss_rate(loss);
            serve(bind, root, rooms, config, metrics).await
        }
        Mode::Upload { server, room, file, name, algo, loss, metrics } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cannot derive a name from {}", file.display()))?,
            };
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;

            let (sink, writer) = open_metrics(metrics.as_deref()).await?;
            let config = TransferConfig::default().with_algorithm(algo).with_loss_rate(loss);
            let client = Client::new(config).with_metrics(sink.clone());
            let result = client.upload(server, &room, &name, Bytes::from(data)).await;
            drop(client);
            close_metrics(sink, writer).await;

            let report = result.with_context(|| format!("uploading {name} to room {room}"))?;
            print_report("uploaded", &report);
            Ok(())
        }
        Mode::Download { server, room, name, out, algo, metrics } => {
            let (sink, writer) = open_metrics(metrics.as_deref()).await?;
            let client = Client::new(TransferConfig::default().with_algorithm(algo)).with_metrics(sink.clone());
            let result = client.download(server, &room, &name).await;
            drop(client);
            close_metrics(sink, writer).await;

            let (data, report) = result.with_context(|| format!("downloading {name} from room {room}"))?;
            tokio::fs::write(&out, &data)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            print_report("downloaded", &report);
            Ok(())
        }
    }
}
