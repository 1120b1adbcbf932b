// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

use std::path::PathBuf;

use beamlet::{CookieSource, NodeConfig};
use clap::Parser;

mod distributed;

#[derive(Debug, clap::Subcommand)]
enum Cli {
    /// Start a node hosting an `echo` process which answers `{From, Msg}` with `Msg`
    Echo {
        /// The short node name
        #[arg(long)]
        name: String,
    },
    /// Start a node, send `{self(), Message}` to `{echo, Peer}` and print the reply
    Ping {
        /// The short node name
        #[arg(long)]
        name: String,
        /// The full name of the node hosting `echo`
        #[arg(long)]
        peer: String,
        /// The text to send
        #[arg(long, default_value = "ping")]
        message: String,
        /// How long to wait for the reply, in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[derive(Parser, Debug)]
struct Args {
    #[command(subcommand)]
    command: Cli,

    /// The host part of the node name
    #[arg(long, global = true, default_value = "localhost")]
    hostname: String,

    /// Use this cookie instead of reading `$HOME/.erlang.cookie`
    #[arg(long, global = true)]
    cookie: Option<String>,

    /// Read the cookie from this file
    #[arg(long, global = true, conflicts_with = "cookie")]
    cookie_file: Option<PathBuf>,
}

impl Args {
    fn config(&self, name: &str) -> NodeConfig {
        let mut config = NodeConfig::new(name, self.hostname.clone());
        config.cookie = match (&self.cookie, &self.cookie_file) {
            (Some(cookie), _) => CookieSource::Value(cookie.clone()),
            (None, Some(path)) => CookieSource::File(path.clone()),
            (None, None) => CookieSource::default_file(),
        };
        config
    }
}

// MAIN //
#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match &args.command {
        Cli::Echo { name } => distributed::run_echo(args.config(name)).await,
        Cli::Ping {
            name,
            peer,
            message,
            timeout_ms,
        } => {
            distributed::run_ping(
                args.config(name),
                peer,
                message,
                std::time::Duration::from_millis(*timeout_ms),
            )
            .await
        }
    };

    if let Err(err) = result {
        log::error!("{err}");
        std::process::exit(1);
    }
}
