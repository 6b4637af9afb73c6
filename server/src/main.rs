//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Linerelay Server
//!
//! Listens on a TCP port and relays every line any client sends to every
//! connected client.
//!
//! ## Usage
//!
//! ```bash
//! linerelay-server --port 6789
//! ```
//!
//! Connect with any line-oriented client:
//! ```bash
//! nc localhost 6789
//! ```

use clap::Parser;
use linerelay_service::{BroadcastRelay, DEFAULT_PORT, LoggingObserver, RelayConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Line broadcast relay
#[derive(Debug, Parser)]
#[command(name = "linerelay-server", version, about = "Line-oriented TCP broadcast relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "LINERELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Relay stopped on error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let relay = BroadcastRelay::bind(RelayConfig::with_port(args.port)).await?;
    info!("Listening for connections on port {}", args.port);

    tokio::select! {
        result = relay.serve(Arc::new(LoggingObserver)) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            relay.shutdown().await?;
        }
    }

    Ok(())
}
