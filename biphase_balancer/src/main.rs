//! Biphase load-balancer executable. Reads the workload parameters and the
//! backend list from stdin: put_pct, rem_pct, data_size, N, then N lines of
//! `<ip> <port>`.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::process::exit;

use biphase::{pf_error, pf_warn, BiphaseError, LoadBalancer, WorkloadParams};

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Port to listen for client queries on.
    port: u16,
}

/// Pulls the next whitespace-separated token out of the stdin stream.
fn next_token<'i>(
    tokens: &mut impl Iterator<Item = &'i str>,
    what: &str,
) -> Result<&'i str, BiphaseError> {
    tokens
        .next()
        .ok_or_else(|| BiphaseError(format!("missing {} in input", what)))
}

/// Parses the workload parameters and backend list from stdin.
fn parse_stdin(input: &str) -> Result<(WorkloadParams, Vec<SocketAddr>), BiphaseError> {
    let mut tokens = input.split_whitespace();

    let put_percent: f64 = next_token(&mut tokens, "put_percent")?.parse()?;
    if !(0.0..=1.0).contains(&put_percent) {
        return Err(BiphaseError(
            "percentage of puts must be between 0 and 1".into(),
        ));
    }

    let rem_percent: f64 = next_token(&mut tokens, "rem_percent")?.parse()?;
    if rem_percent < 0.0 || put_percent + rem_percent > 1.0 {
        return Err(BiphaseError(
            "percentage of removes must be between 0 and 1 and \
             (puts + removes) must be <= 1"
                .into(),
        ));
    }

    let data_size: u64 = next_token(&mut tokens, "data_size")?.parse()?;

    let num_backends: usize =
        next_token(&mut tokens, "number of backends")?.parse()?;
    if num_backends == 0 {
        return Err(BiphaseError(
            "you must specify a positive number of backends".into(),
        ));
    }

    let mut backends = Vec::with_capacity(num_backends);
    for _ in 0..num_backends {
        let ip = next_token(&mut tokens, "backend ip")?;
        let port: u16 = next_token(&mut tokens, "backend port")?.parse()?;
        backends.push(format!("{}:{}", ip, port).parse()?);
    }

    Ok((
        WorkloadParams {
            put_percent,
            rem_percent,
            data_size,
        },
        backends,
    ))
}

// Load-balancer executable main entrance.
fn balancer_main() -> Result<(), BiphaseError> {
    let args = CliArgs::parse();
    if args.port <= 1024 {
        return Err(BiphaseError(format!("invalid port {}", args.port)));
    }
    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let (params, backends) = parse_stdin(&input)?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-balancer")
        .build()?;

    runtime.block_on(async move {
        let mut balancer =
            LoadBalancer::new_and_setup(addr, params, backends).await?;

        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                pf_warn!("b"; "interrupt signal caught");
                let _ = tx_term.send(true);
            }
        });

        balancer.run(rx_term).await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(e) = balancer_main() {
        pf_error!("b"; "balancer_main exited: {}", e);
        exit(-1);
    }
}

#[cfg(test)]
mod balancer_args_tests {
    use super::*;

    #[test]
    fn parse_valid_stdin() -> Result<(), BiphaseError> {
        let input = "0.1 0.05 500 2\n10.0.0.1 52800\n10.0.0.2 52800\n";
        let (params, backends) = parse_stdin(input)?;
        assert_eq!(params.put_percent, 0.1);
        assert_eq!(params.rem_percent, 0.05);
        assert_eq!(params.data_size, 500);
        assert_eq!(
            backends,
            vec![
                "10.0.0.1:52800".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:52800".parse::<SocketAddr>().unwrap(),
            ]
        );
        Ok(())
    }

    #[test]
    fn parse_invalid_put_percent() {
        assert!(parse_stdin("1.5 0 500 1\n10.0.0.1 52800\n").is_err());
    }

    #[test]
    fn parse_invalid_sum() {
        assert!(parse_stdin("0.7 0.5 500 1\n10.0.0.1 52800\n").is_err());
    }

    #[test]
    fn parse_zero_backends() {
        assert!(parse_stdin("0.1 0.1 500 0\n").is_err());
    }

    #[test]
    fn parse_truncated_input() {
        assert!(parse_stdin("0.1 0.1 500 2\n10.0.0.1 52800\n").is_err());
    }
}
