use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;

use crate::monitor::HeartbeatConfig;
use crate::router::OfferPolicy;
use crate::session::SessionConfig;

/// Server flags. Every flag can also come from the environment.
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_SIGNAL_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// HS256 secret used to verify (and, in dev mode, issue) bearer tokens.
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Lifetime of issued access tokens.
    #[arg(long, env = "JWT_EXPIRATION_HOURS", default_value_t = 1)]
    pub access_token_ttl_hours: u64,

    /// Lifetime of issued refresh tokens.
    #[arg(long, env = "JWT_REFRESH_EXPIRATION_DAYS", default_value_t = 30)]
    pub refresh_token_ttl_days: u64,

    /// Interval between protocol pings on every connection.
    #[arg(long, env = "BEACH_SIGNAL_PROBE_INTERVAL_SECS", default_value_t = 10)]
    pub probe_interval_secs: u64,

    /// Close connections that send no application traffic for this long.
    #[arg(long, env = "BEACH_SIGNAL_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Frames queued per connection before forwarders wait.
    #[arg(long, env = "BEACH_SIGNAL_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Liveness signals queued per heartbeat monitor.
    #[arg(long, env = "BEACH_SIGNAL_LIVENESS_BUFFER", default_value_t = 10)]
    pub liveness_buffer: usize,

    /// Longest a forward may wait on a stalled recipient.
    #[arg(long, env = "BEACH_SIGNAL_WRITE_TIMEOUT_SECS", default_value_t = 5)]
    pub write_timeout_secs: u64,

    /// How offers pick their producer.
    #[arg(
        long,
        env = "BEACH_SIGNAL_OFFER_POLICY",
        value_enum,
        default_value_t = OfferPolicy::FirstProducer
    )]
    pub offer_policy: OfferPolicy,

    /// Only log failed forwards instead of closing the unreachable recipient.
    #[arg(long, env = "BEACH_SIGNAL_KEEP_UNREACHABLE", default_value_t = false)]
    pub keep_unreachable_recipients: bool,

    /// Do not mount the development token endpoints.
    #[arg(long, env = "BEACH_SIGNAL_DISABLE_TOKEN_ISSUER", default_value_t = false)]
    pub disable_token_issuer: bool,

    /// Machine id mixed into generated ids.
    #[arg(long, env = "BEACH_SIGNAL_MACHINE_ID", default_value_t = 0)]
    pub machine_id: u16,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_SIGNAL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub secret_key: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub heartbeat: HeartbeatConfig,
    pub session: SessionConfig,
    pub offer_policy: OfferPolicy,
    pub evict_unreachable: bool,
    pub issuer_enabled: bool,
    pub machine_id: u16,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        let secret_key = args.secret_key.unwrap_or_default();
        if secret_key.trim().is_empty() {
            bail!("secret key must not be empty; pass --secret-key or set SECRET_KEY");
        }

        if args.probe_interval_secs == 0 || args.idle_timeout_secs == 0 {
            bail!("probe interval and idle timeout must be greater than zero");
        }
        if args.probe_interval_secs >= args.idle_timeout_secs {
            bail!(
                "probe interval ({}s) must be shorter than idle timeout ({}s)",
                args.probe_interval_secs,
                args.idle_timeout_secs
            );
        }
        if args.outbound_buffer == 0 || args.liveness_buffer == 0 {
            bail!("outbound and liveness buffers must hold at least one entry");
        }
        if args.write_timeout_secs == 0 {
            bail!("write timeout must be greater than zero");
        }
        if args.access_token_ttl_hours == 0 || args.refresh_token_ttl_days == 0 {
            bail!("token lifetimes must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr,
            secret_key,
            access_token_ttl: Duration::from_secs(args.access_token_ttl_hours * 3600),
            refresh_token_ttl: Duration::from_secs(args.refresh_token_ttl_days * 86_400),
            heartbeat: HeartbeatConfig {
                probe_interval: Duration::from_secs(args.probe_interval_secs),
                idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            },
            session: SessionConfig {
                outbound_buffer: args.outbound_buffer,
                liveness_buffer: args.liveness_buffer,
                write_timeout: Duration::from_secs(args.write_timeout_secs),
            },
            offer_policy: args.offer_policy,
            evict_unreachable: !args.keep_unreachable_recipients,
            issuer_enabled: !args.disable_token_issuer,
            machine_id: args.machine_id,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
