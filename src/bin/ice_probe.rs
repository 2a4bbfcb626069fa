use anyhow::{Context, Result};
use clap::Parser;
use sharp_ice::nat::{DEFAULT_STUN_PORT, DEFAULT_TURN_PORT};
use sharp_ice::{
    init_logging, interface_summary, to_sdp, IceAgent, IceConfig, IceEvent, StunServerConfig, TurnServerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "SHARP ICE candidate probe", long_about = None)]
struct Args {
    /// STUN server (host or host:port), repeatable
    #[arg(long = "stun")]
    stun: Vec<String>,

    /// TURN server (host or host:port)
    #[arg(long)]
    turn: Option<String>,

    /// TURN username
    #[arg(long, requires = "turn")]
    username: Option<String>,

    /// TURN password
    #[arg(long, requires = "turn")]
    password: Option<String>,

    /// Number of components (1 or 2)
    #[arg(long)]
    components: Option<u32>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print usable interfaces before gathering
    #[arg(long)]
    interfaces: bool,
}

/// Split `host[:port]`, keeping bracketed or bare IPv6 literals intact
fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').context("unterminated IPv6 literal")?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().with_context(|| format!("bad port in {}", value))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), port.parse().with_context(|| format!("bad port in {}", value))?))
        }
        _ => Ok((value.to_string(), default_port)),
    }
}

fn build_config(args: &Args) -> Result<IceConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {:?}", path))?
        }
        None => IceConfig::default(),
    };

    if !args.stun.is_empty() {
        config.stun_servers = args
            .stun
            .iter()
            .map(|s| split_host_port(s, DEFAULT_STUN_PORT).map(|(host, port)| StunServerConfig::new(host, port)))
            .collect::<Result<_>>()?;
    }

    if let Some(turn) = &args.turn {
        let (server, port) = split_host_port(turn, DEFAULT_TURN_PORT)?;
        config.turn_servers = vec![TurnServerConfig {
            server,
            port,
            username: args.username.clone().unwrap_or_default(),
            password: args.password.clone().unwrap_or_default(),
            ..Default::default()
        }];
        config.gather_relay = true;
    }

    if let Some(components) = args.components {
        config.components = components;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    if args.interfaces {
        println!("{}", interface_summary());
        println!();
    }

    let config = build_config(&args)?;
    let agent = IceAgent::new(config)?;

    // Print candidates as they arrive
    agent.set_event_callback(Arc::new(|event| {
        if let IceEvent::CandidateGathered(candidate) = event {
            println!("a={}", to_sdp(&candidate));
        }
    }));

    let credentials = agent.get_local_credentials();
    println!("a=ice-ufrag:{}", credentials.ufrag);
    println!("a=ice-pwd:{}", credentials.pwd);

    let result = agent.gather_candidates().await;
    let state = agent.get_state();
    let gathered = agent.get_local_candidates().len();
    agent.close().await?;
    result?;

    println!("\n{} candidates, state {}", gathered, state);
    Ok(())
}
