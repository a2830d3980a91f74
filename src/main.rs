use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use size::Size;
use tokio::sync::mpsc;

use piece_stream::Config;
use piece_stream::command::{CommandExecutor, EngineClient};
use piece_stream::engine::LocalEngine;
use piece_stream::event::{FileDescriptor, TorrentDescriptor};
use piece_stream::file::FilePriority;
use piece_stream::session::{DownloadSession, Notification};

const PIECE_DELAY: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: piece-stream <file> [piece-size-kib]")?;
    let piece_size = match std::env::args().nth(2) {
        Some(kib) => Size::from_kibibytes(kib.parse::<u64>().context("invalid piece size")?),
        None => Size::from_kibibytes(256),
    };
    let descriptor = describe(&path, piece_size.bytes() as u64).await?;
    let save_directory = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let config = Arc::new(Config::new());
    let (commands_tx, commands_rx) = mpsc::channel(config.commands_buffer);
    let (events_tx, events_rx) = mpsc::channel(config.events_buffer);
    let (notifications_tx, mut notifications_rx) = mpsc::channel(config.notifications_buffer);

    let session = DownloadSession::new(
        descriptor.name.clone(),
        &save_directory,
        Arc::clone(&config),
        EngineClient::new(commands_tx),
        notifications_tx,
    );
    let event_loop = session.spawn(events_rx);
    let (engine, engine_task) = LocalEngine::spawn(descriptor, events_tx, PIECE_DELAY);
    let executor = CommandExecutor::new(engine).spawn(commands_rx);

    tokio::spawn(async move {
        while let Some(notification) = notifications_rx.recv().await {
            match notification {
                Notification::Stats(stats) => info!(
                    "downloaded {} of {} ({:.1}%)",
                    Size::from_bytes(stats.downloaded_bytes),
                    Size::from_bytes(stats.total_bytes),
                    stats.progress * 100.0
                ),
                Notification::ResumeData(data) => info!("resume data: {:?}", data),
                Notification::TorrentFinished => info!("torrent finished"),
                Notification::Closed => break,
            }
        }
    });

    let files = session.files().await?;
    let entry = files.first().context("torrent has no files")?;
    let handle = entry.create_handle();
    handle.resume(FilePriority::High)?;

    let mut input = handle.create_input().await?;
    let mut buf = vec![0; 64 * 1024];
    let mut total = 0;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        info!(
            "read {} at {}, buffered {:?}",
            Size::from_bytes(n),
            input.position(),
            input.buffered_range()
        );
    }
    info!("streamed {} from {}", Size::from_bytes(total), path.display());

    input.close();
    handle.close();
    session.close();
    event_loop.await?;
    engine_task.abort();
    executor.abort();
    Ok(())
}

async fn describe(path: &Path, piece_length: u64) -> anyhow::Result<TorrentDescriptor> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let file_name = path
        .file_name()
        .context("path has no file name")?
        .to_string_lossy()
        .into_owned();
    Ok(TorrentDescriptor {
        name: file_name.clone(),
        piece_length,
        files: vec![FileDescriptor {
            path: PathBuf::from(file_name),
            size: metadata.len(),
        }],
    })
}
