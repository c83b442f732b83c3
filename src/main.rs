use undertow::{start_download, Config, DownloadEvent, MetaInfo};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let path = std::env::args().nth(1).ok_or("usage: undertow <file.torrent>")?;
    let metainfo = MetaInfo::new(&path)?;
    println!(
        "{} ({}, {} pieces, info hash {})",
        metainfo.name(),
        metainfo.size_fmt(),
        metainfo.num_pieces(),
        metainfo.info_hash_hex(),
    );

    let (handle, mut events) = start_download(metainfo, Vec::new(), Config::default())?;

    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::Completed => {
                println!("download complete");
                break;
            },
            DownloadEvent::Failed { reason } => {
                println!("download failed: {}", reason);
                break;
            },
            DownloadEvent::CorruptPiece { idx } => {
                println!("piece {} was corrupt, re-requesting", idx);
            },
            DownloadEvent::Stats(stats) => {
                println!(
                    "{}/{} pieces, {} peers, {} KiB/s",
                    stats.pieces.num_verified,
                    stats.pieces.num_pieces,
                    stats.peers.len(),
                    stats.throughput.down.avg() / 1024,
                );
            },
        }
    }

    handle.join().await?;
    Ok(())
}
