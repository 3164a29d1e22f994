// Gateway configuration.
//
// Command-line flags set the base values; environment variables, when set
// and parsable, override them.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::Parser;

pub const DEFAULT_WS_PORT: u16 = 8080;
pub const DEFAULT_TCP_PORT: u16 = 8081;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, Parser)]
#[command(name = "strand-gateway", about = "Bridge WebSocket clients to TCP backend workers")]
pub struct GatewayArgs {
    /// Port for browser WebSocket connections.
    #[arg(long, default_value_t = DEFAULT_WS_PORT)]
    pub ws_port: u16,
    /// Port backend workers connect to.
    #[arg(long, default_value_t = DEFAULT_TCP_PORT)]
    pub tcp_port: u16,
    /// Address both listeners bind to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,
    /// Upper bound on waiting for a backend response. Unset or 0 waits
    /// indefinitely.
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for GatewayArgs {
    fn default() -> Self {
        Self {
            ws_port: DEFAULT_WS_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            call_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// WebSocket listen address.
    pub ws_addr: SocketAddr,
    /// Backend TCP listen address.
    pub tcp_addr: SocketAddr,
    pub call_timeout: Option<Duration>,
    /// Log filter directive (e.g. `info`, `strand_gateway=debug`).
    pub log_filter: String,
}

impl GatewayConfig {
    /// Resolve flags against the process environment.
    ///
    /// | Variable | Overrides |
    /// |---|---|
    /// | `PYSTRAND_WS_PORT` | `--ws-port` |
    /// | `PYSTRAND_TCP_PORT` | `--tcp-port` |
    /// | `STRAND_CALL_TIMEOUT_MS` | `--call-timeout-ms` |
    /// | `STRAND_LOG` | log filter, default `info` |
    pub fn from_args(args: GatewayArgs) -> Self {
        Self::from_args_and_env_fn(args, |key| std::env::var(key))
    }

    /// Both listeners on ephemeral loopback ports.
    pub fn loopback() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            ws_addr: SocketAddr::new(localhost, 0),
            tcp_addr: SocketAddr::new(localhost, 0),
            call_timeout: None,
            log_filter: DEFAULT_LOG_FILTER.into(),
        }
    }

    fn from_args_and_env_fn<F>(args: GatewayArgs, env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|value| value.trim().parse::<u64>().ok());
        let port = |key: &str, fallback: u16| {
            parsed(key).and_then(|value| u16::try_from(value).ok()).unwrap_or(fallback)
        };

        let ws_port = port("PYSTRAND_WS_PORT", args.ws_port);
        let tcp_port = port("PYSTRAND_TCP_PORT", args.tcp_port);
        let call_timeout_ms = parsed("STRAND_CALL_TIMEOUT_MS").or(args.call_timeout_ms);
        let log_filter = env("STRAND_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.into());

        Self {
            ws_addr: SocketAddr::new(args.host, ws_port),
            tcp_addr: SocketAddr::new(args.host, tcp_port),
            call_timeout: call_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            log_filter,
        }
    }
}
