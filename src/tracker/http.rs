use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use tokio::time;
use url::Url;
use super::{AnnounceParams, Result, Tracker, TrackerError, ANNOUNCE_TIMEOUT, DEFAULT_ANNOUNCE_INTERVAL};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // Opaque id some trackers hand out, echoed on later announces.
    id: Option<String>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

}

impl HttpTracker {

    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
        }
    }

    // The info hash and peer id are raw bytes and must be percent-encoded
    // by hand, reqwest's query builder would mangle them.
    fn announce_url(&self, params: &AnnounceParams) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(id) = &self.id {
            url.push_str(&format!("&trackerid={}", id));
        }
        url
    }
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {

        let url = self.announce_url(&params);
        tracing::debug!("announce url: {}", url);

        let raw_resp = time::timeout(ANNOUNCE_TIMEOUT, async {
            self.client.get(url).send().await?.bytes().await
        }).await??;

        let resp: HttpResponse = serde_bencode::from_bytes(&raw_resp)?;
        tracing::debug!("announce response: {:#?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Response(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        self.interval = resp.interval.map(Duration::from_secs);
        self.min_interval = resp.min_interval.map(Duration::from_secs);
        if let Some(id) = resp.tracker_id {
            self.id = Some(id);
        }

        self.last_announce = Some(Instant::now());
        Ok(resp.peers)
    }

    fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self.min_interval.unwrap_or(Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL))
            },
            None => true,
        }
    }

    fn should_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL))
            },
            None => true,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present no other keys may be; a human readable error.
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,

    #[serde(default, rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds to wait between regular announces.
    #[serde(default)]
    pub interval: Option<u64>,

    // Announcing more often than this is forbidden.
    #[serde(default, rename = "min interval")]
    pub min_interval: Option<u64>,

    #[serde(default, rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Seeder count.
    #[serde(default)]
    pub complete: Option<u64>,

    // Leecher count.
    #[serde(default)]
    pub incomplete: Option<u64>,

    #[serde(default, deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

// Trackers answer with either the compact string model (6 bytes per peer,
// ip then port, network order) or a list of dictionaries, regardless of
// what was asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer string not a multiple of 6"));
            }

            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                let ip = Ipv4Addr::from(v.get_u32());
                peers.push(SocketAddr::new(IpAddr::V4(ip), v.get_u16()));
            }
            Ok(peers)
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&v)
        }

        fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(v.as_bytes())
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}
