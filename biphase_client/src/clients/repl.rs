//! Interactive REPL client: reads `get`/`put`/`remove` commands from stdin
//! and prints their results.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;

use biphase::{pf_error, BiphaseError, TwoPhaseAqClient};

/// Interactive REPL mode client struct.
pub struct ClientRepl {
    /// Protocol client endpoint.
    endpoint: TwoPhaseAqClient<String>,
}

impl ClientRepl {
    /// Creates a new REPL mode client targeting the given server.
    pub fn new(server: SocketAddr) -> Self {
        ClientRepl {
            endpoint: TwoPhaseAqClient::new(server),
        }
    }

    /// Prints the prompt string.
    fn print_prompt() {
        print!(">>> ");
        let _ = io::stdout().flush();
    }

    /// Executes one input line; returns false upon the exit command.
    async fn eval_line(&mut self, line: &str) -> Result<bool, BiphaseError> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            None => Ok(true),

            Some("get") => {
                let key = match tokens.next() {
                    Some(key) => key,
                    None => {
                        println!("usage: get <key>");
                        return Ok(true);
                    }
                };
                let value = self.endpoint.get(key).await?;
                println!("> {} : {}", key, value);
                Ok(true)
            }

            Some("put") => {
                let (key, value) = match (tokens.next(), tokens.next()) {
                    (Some(key), Some(value)) => (key, value),
                    _ => {
                        println!("usage: put <key> <value>");
                        return Ok(true);
                    }
                };
                self.endpoint.put(key, value.into()).await?;
                println!("> put '{}' ok", key);
                Ok(true)
            }

            Some("remove") => {
                let key = match tokens.next() {
                    Some(key) => key,
                    None => {
                        println!("usage: remove <key>");
                        return Ok(true);
                    }
                };
                self.endpoint.remove(key).await?;
                println!("> remove '{}' ok", key);
                Ok(true)
            }

            Some("help") => {
                println!("commands: get <k> | put <k> <v> | remove <k> | exit");
                Ok(true)
            }

            Some("exit") => Ok(false),

            Some(cmd) => {
                println!("invalid command: {}", cmd);
                Ok(true)
            }
        }
    }

    /// Runs the REPL loop.
    pub async fn run(&mut self) -> Result<(), BiphaseError> {
        self.endpoint.connect().await?;
        println!("connected; type 'help' for the command list");

        let stdin = io::stdin();
        Self::print_prompt();
        for line in stdin.lock().lines() {
            let line = line?;
            match self.eval_line(&line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => pf_error!("c"; "error evaluating command: {}", e),
            }
            Self::print_prompt();
        }

        self.endpoint.leave().await?;
        Ok(())
    }
}
