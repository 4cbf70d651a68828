use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 512;
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-connection limits shared by both pumps.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub outbound_capacity: usize,
    pub max_message_bytes: usize,
    /// Longest silence tolerated from a peer before its connection is dropped.
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl ConnectionConfig {
    /// Heartbeat period, 9/10 of the read deadline so a probe always lands
    /// before the peer's deadline runs out.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub require_rooms: bool,
    pub room_ttl: Duration,
    pub shutdown_grace: Duration,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay",
    author,
    version,
    about = "Beach signaling relay: fans WebSocket signaling frames out to every connected peer"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis URL backing room admission. Rooms live in process memory when unset.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Only admit WebSocket peers that name an existing room.
    #[arg(long, env = "BEACH_RELAY_REQUIRE_ROOMS", default_value_t = false)]
    pub require_rooms: bool,

    /// Lifetime of a room after creation.
    #[arg(long, env = "BEACH_RELAY_ROOM_TTL_SECS", default_value_t = 86_400)]
    pub room_ttl_secs: u64,

    /// Payloads queued per connection before the peer is considered unresponsive.
    #[arg(long, env = "BEACH_RELAY_OUTBOUND_CAPACITY", default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Largest inbound payload accepted from a peer.
    #[arg(long, env = "BEACH_RELAY_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Read deadline; the heartbeat period is derived from it.
    #[arg(long, env = "BEACH_RELAY_PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Deadline for a single write to a peer.
    #[arg(long, env = "BEACH_RELAY_WRITE_WAIT_SECS", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        if cli.outbound_capacity == 0 {
            bail!("outbound capacity must be greater than zero");
        }
        if cli.max_message_bytes == 0 {
            bail!("max message size must be greater than zero");
        }
        if cli.pong_wait_secs == 0 || cli.write_wait_secs == 0 {
            bail!("read and write deadlines must be greater than zero");
        }
        if cli.room_ttl_secs == 0 {
            bail!("room ttl must be greater than zero");
        }
        if cli.require_rooms && cli.redis_url.is_none() {
            tracing::warn!("room admission enabled without REDIS_URL; rooms are process-local");
        }

        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url.filter(|url| !url.trim().is_empty()),
            require_rooms: cli.require_rooms,
            room_ttl: Duration::from_secs(cli.room_ttl_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            connection: ConnectionConfig {
                outbound_capacity: cli.outbound_capacity,
                max_message_bytes: cli.max_message_bytes,
                pong_wait: Duration::from_secs(cli.pong_wait_secs),
                write_wait: Duration::from_secs(cli.write_wait_secs),
            },
        })
    }
}
