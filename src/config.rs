use std::{path::PathBuf, time::Duration};
use rand::Rng;
use crate::PeerId;

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: PeerId,

    pub output_dir: PathBuf,

    // Port reported to trackers.
    pub listen_port: u16,

    pub min_max_peers: (u32, u32),

    // Target number of outstanding block requests per connection.
    pub pipeline_depth: usize,

    // Duplicate requests across peers are allowed once this few pieces remain.
    pub end_game_threshold: usize,

    // Corrupt pieces a peer may contribute to before being dropped.
    pub max_strikes: u32,

    pub connect_timeout: Duration,

    // An unanswered block request is re-queued after this long.
    pub request_timeout: Duration,

    // A connection with no inbound messages for this long is closed.
    pub idle_timeout: Duration,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: gen_client_id(),
            output_dir: PathBuf::from("downloads"),
            listen_port: 6881,
            min_max_peers: (5, 50),
            pipeline_depth: 20,
            end_game_threshold: 5,
            max_strikes: 3,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

// Client ids follow the Azureus convention, an 8 byte client tag then random bytes.
fn gen_client_id() -> PeerId {
    let mut id = *b"-UW0010-............";
    rand::thread_rng().fill(&mut id[8..]);
    id
}
