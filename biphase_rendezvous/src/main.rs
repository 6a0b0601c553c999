//! Biphase rendezvous service executable.

use std::net::SocketAddr;
use std::process::exit;

use biphase::{pf_error, pf_warn, BiphaseError, RendezvousServer};

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Port to listen for node registrations on.
    #[arg(default_value_t = 8080)]
    port: u16,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), BiphaseError> {
        if self.port <= 1024 {
            Err(BiphaseError(format!("invalid port {}", self.port)))
        } else {
            Ok(())
        }
    }
}

// Rendezvous service executable main entrance.
fn rendezvous_main() -> Result<(), BiphaseError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-rendezvous")
        .build()?;

    runtime.block_on(async move {
        let mut server = RendezvousServer::new_and_setup(addr).await?;

        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                pf_warn!("r"; "interrupt signal caught");
                let _ = tx_term.send(true);
            }
        });

        server.run(rx_term).await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(e) = rendezvous_main() {
        pf_error!("r"; "rendezvous_main exited: {}", e);
        exit(-1);
    }
}

#[cfg(test)]
mod rendezvous_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() {
        let args = CliArgs { port: 8080 };
        assert!(args.sanitize().is_ok());
    }

    #[test]
    fn sanitize_invalid_port() {
        let args = CliArgs { port: 80 };
        assert!(args.sanitize().is_err());
    }
}
