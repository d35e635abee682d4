//! One-shot setup: asks the panel which ports this node owns and writes
//! `config.json` next to the binaries.
//!
//! Usage: `configure <remote-url> <node-uuid> <token> [base-path]`

use hightd_agent::config::{self, AgentConfig};
use hightd_agent::remote;

const DEFAULT_BASE_PATH: &str = "/var/lib/hightd/volumes";

fn usage() -> ! {
    eprintln!("usage: configure <remote-url> <node-uuid> <token> [base-path]");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args.len() > 4 || args.iter().any(|a| a.trim().is_empty()) {
        usage();
    }

    let remote_url = args[0].trim_end_matches('/').to_string();
    let uuid = args[1].clone();
    let token = args[2].clone();
    let path = args
        .get(3)
        .cloned()
        .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string());

    let ports = match remote::fetch_ports(&remote_url, &uuid, &token).await {
        Ok(ports) => ports,
        Err(err) => {
            eprintln!("failed to fetch node ports from {remote_url}: {err:#}");
            std::process::exit(1);
        }
    };

    let config = AgentConfig {
        uuid,
        port: ports.port,
        sftp: ports.sftp,
        remote: remote_url,
        token,
        path,
        ssl: ports.ssl,
        cert_path: None,
        key_path: None,
    };

    if let Err(err) = config::save(&config) {
        eprintln!("failed to write config.json: {err:#}");
        std::process::exit(1);
    }

    println!(
        "configured: http port {}, sftp port {}, ssl {}",
        config.port, config.sftp, config.ssl
    );
}
