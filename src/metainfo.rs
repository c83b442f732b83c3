use std::path::PathBuf;
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;
use crate::Sha1Hash;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pieces length, must be non-empty and divisible by 20")]
    InvalidPiecesLength,

    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("{actual} piece hashes do not cover the torrent, expected {expected}")]
    PieceCountMismatch { expected: usize, actual: usize },

}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // Length of the file in bytes.
    pub length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // Path components, one string per directory level then the file name.
    pub path: Vec<String>,

}

// Fields are declared in bencode key order so that re-encoding the dict
// reproduces the exact bytes the info hash was computed over.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // One dictionary per file, only present in multi-file torrents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes, only present in single-file torrents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // Suggested file or directory name.
    pub name: String,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenation of all 20-byte SHA1 piece hashes, index aligned.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

    #[serde(default, rename = "root hash", skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,

}

impl Info {
    // SHA1 of the bencoded info dict, the identity of the torrent.
    fn info_hash(&self) -> Result<Sha1Hash, MetaInfoError> {
        let mut hasher = Sha1::new();
        hasher.update(serde_bencode::to_bytes(self)?);
        Ok(hasher.finalize().into())
    }
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    // The announce URL of the tracker.
    #[serde(default)]
    pub announce: Option<String>,

    // Tiered extension of announce, outer list is ordered by priority.
    #[serde(default, rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default, rename = "created by")]
    pub created_by: Option<String>,

    // Creation time in unix epoch seconds.
    #[serde(default, rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub encoding: Option<String>,

    pub info: Info,

    #[serde(skip)]
    info_hash: Sha1Hash,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        MetaInfo::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(raw)?;

        if metainfo.info.pieces.is_empty() || metainfo.info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if metainfo.info.piece_length == 0 {
            return Err(MetaInfoError::ZeroPieceLength);
        }

        // Piece hashes must cover the torrent length exactly.
        let piece_len = metainfo.info.piece_length as u64;
        let expected = metainfo.total_len().div_ceil(piece_len) as usize;
        let actual = metainfo.info.pieces.len() / 20;
        if expected != actual {
            return Err(MetaInfoError::PieceCountMismatch { expected, actual });
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo parsed: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info.pieces
            .chunks_exact(20)
            // Length checked to be a multiple of 20 in from_bytes.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { (self.info.pieces.len() / 20) as u32 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> Sha1Hash { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Relative path and length of each file, in torrent order.
    pub fn files(&self) -> Vec<(PathBuf, u64)> {
        if let Some(files) = &self.info.files {
            files.iter()
                .map(|f| (f.path.iter().collect(), f.length))
                .collect()
        } else {
            vec![(PathBuf::from(&self.info.name), self.total_len())]
        }
    }

    // Tracker urls grouped by tier. Unparseable urls are dropped.
    pub fn tracker_urls(&self) -> Vec<Vec<Url>> {
        if let Some(announce_list) = &self.announce_list {
            announce_list.iter()
                .map(|tier| tier.iter().filter_map(|s| Url::parse(s).ok()).collect())
                .collect()
        } else if let Some(announce) = &self.announce {
            match Url::parse(announce) {
                Ok(url) => vec![vec![url]],
                Err(_) => Vec::new(),
            }
        } else {
            Vec::new()
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::NaiveDateTime::from_timestamp_opt(v, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "invalid date".to_string())
        })
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

// Piece geometry derived from the metainfo, cheap to clone and passed around widely.
#[derive(Debug, Clone)]
pub struct TorrentInfo {

    pub total_len: u64,

    pub piece_len: usize,

    pub last_piece_len: usize,

    pub num_pieces: u32,

}

impl TorrentInfo {

    pub fn new(metainfo: &MetaInfo) -> Self {
        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
        }
    }

    // Length of the piece at idx, only the last piece may be short.
    pub fn piece_len(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    // Byte offset of the piece within the whole torrent.
    pub fn piece_offset(&self, idx: usize) -> usize {
        idx * self.piece_len
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if size <= 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce)
            .field("announce_list", &self.announce_list)
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Manual impl so the pieces blob isn't dumped into logs.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num_pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds the canonical bencoding of a small single-file torrent.
    fn single_file_torrent(piece_length: u32, length: u64, pieces: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        out.extend_from_slice(format!("6:lengthi{}e", length).as_bytes());
        out.extend_from_slice(b"4:name8:test.bin");
        out.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
        out.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        out.extend_from_slice(pieces);
        out.extend_from_slice(b"ee");
        out
    }

    #[test]
    fn test_metainfo_decode() {
        let pieces = [0xab_u8; 40];
        let raw = single_file_torrent(0x4000, 0x4000 + 100, &pieces);
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();

        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_len(), 0x4000);
        assert_eq!(metainfo.total_len(), 0x4000 + 100);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.name(), "test.bin");
        assert_eq!(metainfo.piece_hashes(), vec![[0xab; 20], [0xab; 20]]);
        assert_eq!(
            metainfo.tracker_urls(),
            vec![vec![Url::parse("http://tracker.example/announce").unwrap()]],
        );

        // The info hash must equal the digest of the embedded info dict,
        // which spans from after the "info" key to the outer dict's end.
        let prefix = b"d8:announce31:http://tracker.example/announce4:info".len();
        let mut hasher = Sha1::new();
        hasher.update(&raw[prefix..raw.len() - 1]);
        let expected: Sha1Hash = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
    }

    #[test]
    fn test_metainfo_piece_count_mismatch() {
        // Three hashes for a two piece torrent.
        let pieces = [0u8; 60];
        let raw = single_file_torrent(0x4000, 0x8000, &pieces);
        match MetaInfo::from_bytes(&raw) {
            Err(MetaInfoError::PieceCountMismatch { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("expected piece count mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_metainfo_invalid_pieces() {
        let raw = single_file_torrent(0x4000, 0x4000, &[0u8; 19]);
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::InvalidPiecesLength),
        ));
    }

    #[test]
    fn test_torrent_info_piece_len() {
        let pieces = [0u8; 40];
        let raw = single_file_torrent(0x4000, 0x4000 + 100, &pieces);
        let info = TorrentInfo::new(&MetaInfo::from_bytes(&raw).unwrap());
        assert_eq!(info.piece_len(0), 0x4000);
        assert_eq!(info.piece_len(1), 100);
        assert_eq!(info.piece_offset(1), 0x4000);
    }
}
