use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::{Duration, Instant},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, Event, Result, Tracker, TrackerError, ANNOUNCE_TIMEOUT, DEFAULT_ANNOUNCE_INTERVAL};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;

pub struct UdpTracker {

    socket: UdpSocket,

    url: Url,

    // Connection ids expire after a minute, so one is fetched per announce.
    conn_id: Option<i64>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

}

impl UdpTracker {

    pub async fn new(url: Url) -> Result<Self> {
        // First available local port.
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            url,
            conn_id: None,
            last_announce: None,
            interval: None,
        })
    }

    async fn connect(&mut self) -> Result<()> {

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::InvalidUrl)?;
        time::timeout(ANNOUNCE_TIMEOUT, self.socket.connect(addr)).await??;

        let trans_id: i32 = rand::random();
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_i32(trans_id);
        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 16];
        let n = time::timeout(ANNOUNCE_TIMEOUT, self.socket.recv(&mut resp_buf)).await??;
        if n < 16 {
            return Err(TrackerError::Response("connect response too short".to_string()));
        }
        let mut resp = &resp_buf[..];
        if resp.get_i32() != ACTION_CONNECT {
            return Err(TrackerError::Response("expected connect action".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::Response("transaction id mismatch".to_string()));
        }
        self.conn_id = Some(resp.get_i64());

        tracing::trace!("connected to tracker");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {

        self.connect().await?;
        let conn_id = self.conn_id.ok_or_else(|| TrackerError::Response("no connection id".to_string()))?;
        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(98);
        buf.put_i64(conn_id);
        buf.put_i32(ACTION_ANNOUNCE);
        buf.put_i32(trans_id);
        buf.put(&params.info_hash[..]);
        buf.put(&params.client_id[..]);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_i32(match params.event {
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
            None => 0,
        });
        buf.put_i32(0); // IP address, 0 = let the tracker use the source.
        buf.put_i32(rand::random()); // Key identifying us across address changes.
        buf.put_i32(match params.num_want {
            Some(num_want) => num_want as i32,
            None => -1,
        });
        buf.put_u16(params.port);
        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 1024];
        let n = time::timeout(ANNOUNCE_TIMEOUT, self.socket.recv(&mut resp_buf)).await??;
        if n < 20 {
            return Err(TrackerError::Response("announce response too short".to_string()));
        }
        let mut resp = &resp_buf[..n];
        if resp.get_i32() != ACTION_ANNOUNCE {
            return Err(TrackerError::Response("expected announce action".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::Response("transaction id mismatch".to_string()));
        }
        let interval = resp.get_i32();
        let _leechers = resp.get_i32();
        let _seeders = resp.get_i32();
        if interval > 0 {
            self.interval = Some(Duration::from_secs(interval as u64));
        }

        let num_peers = (n - 20) / 6;
        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            let ip = resp.get_u32();
            let port = resp.get_u16();
            peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
        }

        self.last_announce = Some(Instant::now());
        Ok(peers)
    }

    fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL))
            },
            None => true,
        }
    }

    fn should_announce(&self, time: Instant) -> bool {
        self.can_announce(time)
    }
}
