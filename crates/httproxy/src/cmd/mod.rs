use std::net::SocketAddr;
use std::str::FromStr;

use clap::Parser;

/// CLI surface for the forward proxy.
///
/// Mirrors the configuration table of the spec: `bind`, `concurrency`,
/// `headers_middleware`, `server_software`, `keep_alive`, plus the logging
/// knobs every binary in this workspace exposes.
#[derive(Debug, Parser)]
#[command(name = "httproxy", about = "A forward HTTP proxy with CONNECT tunneling")]
pub struct Args {
    /// Address to listen on for downstream client connections.
    #[arg(short = 'l', long, env = "HTTPROXY_BIND", default_value = "127.0.0.1:8081")]
    pub bind: SocketAddr,

    /// Number of worker tasks accepting connections off the shared listener.
    #[arg(short = 'c', long, env = "HTTPROXY_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    /// Ordered list of header middlewares to apply to outbound requests.
    /// Recognized names: `x-forwarded-for`, `user-agent-override=<value>`.
    #[arg(long = "middleware", env = "HTTPROXY_MIDDLEWARE", default_values_t = vec!["x-forwarded-for".to_string()])]
    pub headers_middleware: Vec<String>,

    /// Value advertised as the `Server` response header; omit to send none.
    #[arg(long, env = "HTTPROXY_SERVER_SOFTWARE")]
    pub server_software: Option<String>,

    /// Downstream keep-alive idle timeout, in seconds.
    #[arg(long, env = "HTTPROXY_KEEP_ALIVE", default_value_t = 75)]
    pub keep_alive: u64,

    /// log level: off/error/warn/info/debug/trace, or repeat "v" (e.g. "vv" = debug)
    #[arg(short = 'v', long = "log-level", env = "HTTPROXY_LOG_LEVEL", default_value = "info", value_parser = LogLevel::from_str)]
    pub log_level: LogLevel,

    /// Colorize log level in console output.
    #[arg(long, env = "HTTPROXY_LOG_COLORED", default_value_t = false)]
    pub colored: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}

#[derive(Debug, Clone)]
pub struct LogLevel(pub String);

impl FromStr for LogLevel {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const VERBOSE_PAT: char = 'v';

        let level_str = match s.trim().to_ascii_lowercase().as_str() {
            "off" => "off",
            "err" | "error" => "error",
            "warn" | "warning" => "warn",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            rest => {
                let count = rest.chars().filter(|c| c.eq_ignore_ascii_case(&VERBOSE_PAT)).count();
                match count {
                    0 => "off",
                    1 => "info",
                    2 => "debug",
                    3.. => "trace",
                }
            }
        };
        Ok(LogLevel(level_str.to_string()))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
