// End to end downloads against in-process mock seeders speaking the raw
// wire protocol over localhost TCP.

use std::{net::SocketAddr, time::Duration};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use undertow::{start_download, Config, DownloadEvent, MetaInfo};

const PIECE_LEN: usize = 16_384;

// Canonically bencoded single-file torrent with no trackers; the tests
// inject peer addresses directly.
fn build_torrent(pieces: &[Vec<u8>], name: &str) -> Vec<u8> {
    let total_len: usize = pieces.iter().map(|p| p.len()).sum();
    let mut hashes = Vec::new();
    for piece in pieces {
        let digest: [u8; 20] = Sha1::digest(piece).into();
        hashes.extend_from_slice(&digest);
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"d4:infod");
    out.extend_from_slice(format!("6:lengthi{}e", total_len).as_bytes());
    out.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
    out.extend_from_slice(format!("12:piece lengthi{}e", PIECE_LEN).as_bytes());
    out.extend_from_slice(format!("6:pieces{}:", hashes.len()).as_bytes());
    out.extend_from_slice(&hashes);
    out.extend_from_slice(b"ee");
    out
}

fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf.try_into().unwrap())
}

// A minimal seeder: handshake, bitfield, unchoke, then answer requests for
// the pieces it claims until the client hangs up. When `corrupt` is set it
// serves flipped bytes for piece 1.
async fn run_seeder(
    listener: TcpListener,
    info_hash: [u8; 20],
    pieces: Vec<Vec<u8>>,
    have: Vec<bool>,
    corrupt: bool,
) -> anyhow::Result<()> {

    let (mut stream, _) = listener.accept().await?;

    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await?;
    anyhow::ensure!(handshake[0] == 19, "bad protocol length");
    anyhow::ensure!(&handshake[1..20] == b"BitTorrent protocol", "bad protocol string");
    anyhow::ensure!(handshake[28..48] == info_hash, "info hash mismatch");

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(b"-SEED01-000000000000");
    stream.write_all(&reply).await?;

    // bitfield: <len=2><id=5><bits>, enough for up to 8 pieces here.
    let mut bits = 0u8;
    for (i, h) in have.iter().enumerate() {
        if *h {
            bits |= 0x80 >> i;
        }
    }
    stream.write_all(&[0, 0, 0, 2, 5, bits]).await?;
    // unchoke
    stream.write_all(&[0, 0, 0, 1, 1]).await?;

    serve_blocks(&mut stream, &pieces, corrupt).await
}

async fn serve_blocks(stream: &mut TcpStream, pieces: &[Vec<u8>], corrupt: bool) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            // Client went away, we're done.
            return Ok(());
        }
        let len = be32(&len_buf) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        // Only requests need answering; interested/cancel are fine to drop.
        if payload[0] != 6 {
            continue;
        }
        let idx = be32(&payload[1..5]) as usize;
        let begin = be32(&payload[5..9]) as usize;
        let length = be32(&payload[9..13]) as usize;
        anyhow::ensure!(begin + length <= pieces[idx].len(), "request out of range");

        let mut data = pieces[idx][begin..begin + length].to_vec();
        if corrupt && idx == 1 {
            for b in data.iter_mut() {
                *b = !*b;
            }
        }

        let mut msg = Vec::with_capacity(13 + data.len());
        msg.extend_from_slice(&((9 + data.len()) as u32).to_be_bytes());
        msg.push(7);
        msg.extend_from_slice(&(idx as u32).to_be_bytes());
        msg.extend_from_slice(&(begin as u32).to_be_bytes());
        msg.extend_from_slice(&data);
        stream.write_all(&msg).await?;
    }
}

fn test_pieces() -> Vec<Vec<u8>> {
    let piece_0: Vec<u8> = (0..PIECE_LEN).map(|i| (i % 251) as u8).collect();
    let piece_1: Vec<u8> = (0..PIECE_LEN).map(|i| (i % 241) as u8).collect();
    vec![piece_0, piece_1]
}

async fn await_completion(events: &mut undertow::EventRx) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::Completed => return true,
            DownloadEvent::Failed { reason } => panic!("download failed: {}", reason),
            _ => {},
        }
    }
    false
}

#[tokio::test]
async fn test_download_from_single_seeder() -> anyhow::Result<()> {

    let pieces = test_pieces();
    let metainfo = MetaInfo::from_bytes(&build_torrent(&pieces, "test.bin"))?;
    let info_hash = metainfo.info_hash();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let seeder = tokio::spawn(run_seeder(
        listener,
        info_hash,
        pieces.clone(),
        vec![true, true],
        false,
    ));

    let dir = tempfile::tempdir()?;
    let config = Config {
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let (handle, mut events) = start_download(metainfo, vec![addr], config)?;

    let completed = tokio::time::timeout(Duration::from_secs(30), await_completion(&mut events)).await?;
    assert!(completed, "download did not complete");
    handle.join().await?;

    let written = std::fs::read(dir.path().join("test.bin"))?;
    assert_eq!(written.len(), PIECE_LEN * 2);
    assert_eq!(&written[..PIECE_LEN], &pieces[0][..]);
    assert_eq!(&written[PIECE_LEN..], &pieces[1][..]);

    seeder.await??;
    Ok(())
}

#[tokio::test]
async fn test_corrupt_piece_refetched_from_honest_seeder() -> anyhow::Result<()> {

    let pieces = test_pieces();
    let metainfo = MetaInfo::from_bytes(&build_torrent(&pieces, "test.bin"))?;
    let info_hash = metainfo.info_hash();

    // An honest seeder with both pieces.
    let honest_listener = TcpListener::bind("127.0.0.1:0").await?;
    let honest_addr = honest_listener.local_addr()?;
    let honest = tokio::spawn(run_seeder(
        honest_listener,
        info_hash,
        pieces.clone(),
        vec![true, true],
        false,
    ));

    // A seeder claiming only piece 1 and serving garbage for it.
    let corrupt_listener = TcpListener::bind("127.0.0.1:0").await?;
    let corrupt_addr = corrupt_listener.local_addr()?;
    let corrupt = tokio::spawn(run_seeder(
        corrupt_listener,
        info_hash,
        pieces.clone(),
        vec![false, true],
        true,
    ));

    let dir = tempfile::tempdir()?;
    let config = Config {
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let (handle, mut events) = start_download(metainfo, vec![honest_addr, corrupt_addr], config)?;

    // The download must finish with correct bytes no matter which seeder
    // wins any given race; corrupt pieces get discarded and re-requested.
    let completed = tokio::time::timeout(Duration::from_secs(30), await_completion(&mut events)).await?;
    assert!(completed, "download did not complete");
    handle.join().await?;

    let written = std::fs::read(dir.path().join("test.bin"))?;
    assert_eq!(&written[..PIECE_LEN], &pieces[0][..]);
    assert_eq!(&written[PIECE_LEN..], &pieces[1][..]);

    honest.await??;
    drop(corrupt); // may still be waiting if it was struck out early
    Ok(())
}
