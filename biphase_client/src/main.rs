//! Biphase client executable.

use std::net::SocketAddr;
use std::process::exit;

use biphase::{pf_error, BiphaseError};

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

mod clients;
use clients::{ClientBench, ClientRepl};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client utility mode: 'repl' or 'bench'.
    #[arg(short, long, default_value_t = String::from("repl"))]
    mode: String,

    /// Server client-API address (repl mode).
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Load-balancer address (bench mode).
    #[arg(short, long)]
    balancer: Option<SocketAddr>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), BiphaseError> {
        match self.mode.as_str() {
            "repl" => {
                if self.server.is_none() {
                    Err(BiphaseError("repl mode requires --server".into()))
                } else {
                    Ok(())
                }
            }
            "bench" => {
                if self.balancer.is_none() {
                    Err(BiphaseError("bench mode requires --balancer".into()))
                } else {
                    Ok(())
                }
            }
            _ => Err(BiphaseError(format!(
                "utility mode '{}' unrecognized",
                self.mode
            ))),
        }
    }
}

// Client executable main entrance.
fn client_main() -> Result<(), BiphaseError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        match args.mode.as_str() {
            "repl" => {
                let mut repl = ClientRepl::new(args.server.unwrap());
                repl.run().await
            }
            "bench" => {
                let mut bench =
                    ClientBench::new_and_setup(args.balancer.unwrap()).await?;
                bench.run().await
            }
            _ => unreachable!(),
        }
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        exit(-1);
    }
}

#[cfg(test)]
mod client_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid_repl() {
        let args = CliArgs {
            mode: "repl".into(),
            server: Some("127.0.0.1:53800".parse().unwrap()),
            balancer: None,
            threads: 2,
        };
        assert!(args.sanitize().is_ok());
    }

    #[test]
    fn sanitize_repl_missing_server() {
        let args = CliArgs {
            mode: "repl".into(),
            server: None,
            balancer: Some("127.0.0.1:52500".parse().unwrap()),
            threads: 2,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_bench_missing_balancer() {
        let args = CliArgs {
            mode: "bench".into(),
            server: Some("127.0.0.1:53800".parse().unwrap()),
            balancer: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_mode() {
        let args = CliArgs {
            mode: "fuzz".into(),
            server: None,
            balancer: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
    }
}
