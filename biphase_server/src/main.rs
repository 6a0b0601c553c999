//! Biphase server node executable.

use std::net::SocketAddr;
use std::process::exit;

use biphase::{
    pf_error, pf_warn, BiphaseError, GenericReplica, TwoPhaseAqReplica,
};

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address of the local machine.
    self_address: String,

    /// Port used for peer-peer communication; a node's identity within the
    /// cluster is `self_address:self_port`.
    self_port: u16,

    /// Address of the rendezvous service.
    rendezvous_address: String,

    /// Port of the rendezvous service.
    rendezvous_port: u16,

    /// Key-value API port open to clients. Defaults to self_port + 1000.
    #[arg(short, long)]
    api_port: Option<u16>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Protocol-specific configuration TOML string.
    /// Example: '-c batch_interval_ms=5+alive_interval_ms=2000' (TOML, with
    /// '+' in place of newlines).
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the client API port on
    /// success or `Err(BiphaseError)` on any error.
    fn sanitize(&self) -> Result<u16, BiphaseError> {
        let api_port = match self.api_port {
            Some(port) => port,
            None => self.self_port.checked_add(1000).ok_or_else(|| {
                BiphaseError(format!(
                    "self_port {} too large for default api_port",
                    self.self_port
                ))
            })?,
        };
        if self.self_port <= 1024 {
            Err(BiphaseError(format!(
                "invalid self_port {}",
                self.self_port
            )))
        } else if api_port <= 1024 {
            Err(BiphaseError(format!("invalid api_port {}", api_port)))
        } else if api_port == self.self_port {
            Err(BiphaseError(format!(
                "api_port == self_port {}",
                api_port
            )))
        } else if self.rendezvous_port <= 1024 {
            Err(BiphaseError(format!(
                "invalid rendezvous_port {}",
                self.rendezvous_port
            )))
        } else if self.threads < 2 {
            Err(BiphaseError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(api_port)
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), BiphaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let api_port = args.sanitize()?;

    // parse socket addresses
    let p2p_addr: SocketAddr =
        format!("{}:{}", args.self_address, args.self_port).parse()?;
    let api_addr: SocketAddr =
        format!("{}:{}", args.self_address, api_port).parse()?;
    let rendezvous: SocketAddr =
        format!("{}:{}", args.rendezvous_address, args.rendezvous_port)
            .parse()?;

    // config string with '+' replaced by newlines
    let config_str = args.config.as_deref().map(|s| s.replace('+', "\n"));

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-replica")
        .build()?;

    // enter tokio runtime, setup the server node, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut node = TwoPhaseAqReplica::<String>::new_and_setup(
            api_addr,
            p2p_addr,
            rendezvous,
            config_str.as_deref(),
        )
        .await?;

        // watch for termination signals; nodes otherwise loop forever
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                pf_warn!("s"; "interrupt signal caught");
                let _ = tx_term.send(true);
            }
        });

        node.run(rx_term).await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        exit(-1);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), BiphaseError> {
        let args = CliArgs {
            self_address: "127.0.0.1".into(),
            self_port: 52800,
            rendezvous_address: "127.0.0.1".into(),
            rendezvous_port: 52600,
            api_port: Some(52700),
            threads: 2,
            config: None,
        };
        assert_eq!(args.sanitize(), Ok(52700));
        Ok(())
    }

    #[test]
    fn sanitize_default_api_port() -> Result<(), BiphaseError> {
        let args = CliArgs {
            self_address: "127.0.0.1".into(),
            self_port: 52800,
            rendezvous_address: "127.0.0.1".into(),
            rendezvous_port: 52600,
            api_port: None,
            threads: 2,
            config: None,
        };
        assert_eq!(args.sanitize(), Ok(53800));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_self_port() {
        let args = CliArgs {
            self_address: "127.0.0.1".into(),
            self_port: 1023,
            rendezvous_address: "127.0.0.1".into(),
            rendezvous_port: 52600,
            api_port: Some(52700),
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_same_api_self_port() {
        let args = CliArgs {
            self_address: "127.0.0.1".into(),
            self_port: 52800,
            rendezvous_address: "127.0.0.1".into(),
            rendezvous_port: 52600,
            api_port: Some(52800),
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_rendezvous_port() {
        let args = CliArgs {
            self_address: "127.0.0.1".into(),
            self_port: 52800,
            rendezvous_address: "127.0.0.1".into(),
            rendezvous_port: 80,
            api_port: Some(52700),
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            self_address: "127.0.0.1".into(),
            self_port: 52800,
            rendezvous_address: "127.0.0.1".into(),
            rendezvous_port: 52600,
            api_port: Some(52700),
            threads: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }
}
