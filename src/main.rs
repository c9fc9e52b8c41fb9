// flixfetcher -- Collect Kafka partition sizes and broker free space
// Copyright (C) 2024, Tony Rippy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate log;

mod export;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use driver::collect::{FailurePolicy, FreespaceSettings};
use env_logger::Env;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Datadog API key.
    #[arg(long, env = "FLIXFETCHER_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Datadog application key.
    #[arg(long, env = "FLIXFETCHER_APP_KEY", default_value = "", hide_env_values = true)]
    app_key: String,

    /// Base URL of the Datadog API.
    #[arg(long, env = "FLIXFETCHER_API_URL", default_value = driver::datadog::DEFAULT_API_URL)]
    api_url: String,

    /// ZooKeeper connect string.
    #[arg(long, env = "FLIXFETCHER_ZK_ADDR", default_value = "localhost:2181")]
    zk_addr: String,

    /// ZooKeeper path Kafka's metadata lives under.
    #[arg(long, env = "FLIXFETCHER_ZK_PREFIX", default_value = "")]
    zk_prefix: String,

    /// Port of the Jolokia agent on every broker.
    #[arg(long, env = "FLIXFETCHER_JOLOKIA_PORT", default_value_t = driver::jolokia::DEFAULT_PORT)]
    jolokia_port: u16,

    /// Output files prefix.
    #[arg(long, env = "FLIXFETCHER_OUTPUT_FILE_PREFIX", default_value = "flixfetcher.")]
    output_file_prefix: String,

    /// Aggregation used when querying broker free space.
    #[arg(
        long,
        env = "FLIXFETCHER_FREESPACE_AGGREGATION",
        default_value = "sum",
        value_parser = ["sum", "max", "min", "avg"]
    )]
    freespace_aggregation: String,

    /// How far back to look for free space points, in seconds.
    #[arg(long, env = "FLIXFETCHER_FREESPACE_WINDOW", default_value_t = 60)]
    freespace_window: u64,

    /// What to do when a broker's free space can't be read:
    /// "best-effort" leaves it out, "fail-fast" aborts.
    #[arg(long, env = "FLIXFETCHER_FREESPACE_POLICY", default_value = "best-effort")]
    freespace_policy: FailurePolicy,

    /// Timeout for every remote query, in seconds.
    #[arg(long, env = "FLIXFETCHER_QUERY_TIMEOUT", default_value_t = 10)]
    query_timeout: u64,

    /// Also collect from brokers that register no plaintext host,
    /// using the host of their first listener.
    #[arg(long, env = "FLIXFETCHER_INCLUDE_UNAVAILABLE")]
    include_unavailable: bool,

    /// Verbose output.
    #[arg(short, long, env = "FLIXFETCHER_VERBOSE")]
    verbose: bool,

    /// Print the output files instead of writing them.
    #[arg(long, env = "FLIXFETCHER_DRY_RUN")]
    dry_run: bool,
}

impl driver::Args for Args {
    fn api_key(&self) -> &str {
        self.api_key.as_str()
    }

    fn app_key(&self) -> &str {
        self.app_key.as_str()
    }

    fn api_url(&self) -> &str {
        self.api_url.as_str()
    }

    fn zk_addr(&self) -> &str {
        self.zk_addr.as_str()
    }

    fn zk_prefix(&self) -> &str {
        self.zk_prefix.as_str()
    }

    fn jolokia_port(&self) -> u16 {
        self.jolokia_port
    }

    fn include_unavailable(&self) -> bool {
        self.include_unavailable
    }

    fn freespace(&self) -> FreespaceSettings {
        FreespaceSettings {
            aggregation: self.freespace_aggregation.clone(),
            window: Duration::from_secs(self.freespace_window),
            policy: self.freespace_policy,
        }
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    fn verbose(&self) -> bool {
        self.verbose
    }
}

fn main() -> ExitCode {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
    debug!("logging configured");

    let exporter: Box<dyn driver::Exporter> = if args.dry_run {
        Box::new(export::DryRunExporter::new(
            &args.output_file_prefix,
            std::io::stdout(),
        ))
    } else {
        Box::new(export::FileExporter::new(&args.output_file_prefix))
    };
    driver::run(&args, exporter)
}
