// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use stackcat::{
  common::{
    driver::registry::DriverRegistry, pipeline::spec::EndpointRole, tunnel::TunnelOptions,
  },
  util,
};

use util::validators::{
  parse_duration_secs, parse_endpoint, validate_duration_secs, validate_endpoint,
};

mod certgen;
mod tunnel;

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

fn main() {
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("log-level")
        .long("log-level")
        .global(true)
        .possible_values(LOG_LEVELS)
        .default_value("info")
        .takes_value(true),
    )
    .subcommand(
      Command::new("tunnel")
        .about("Relay connections between a source endpoint and a destination endpoint")
        .arg(
          Arg::new("connect-source")
            .long("connect-source")
            .help("Dial the source endpoint instead of listening on it"),
        )
        .arg(
          Arg::new("grace")
            .long("grace")
            .help("Seconds live sessions may continue once shutdown begins")
            .validator(validate_duration_secs)
            .default_value("5")
            .takes_value(true),
        )
        .arg(
          Arg::new("handshake-timeout")
            .long("handshake-timeout")
            .help("Seconds allowed for each session's handshakes; 0 disables the limit")
            .validator(validate_duration_secs)
            .default_value("30")
            .takes_value(true),
        )
        .arg(
          Arg::new("source")
            .help("Layered endpoint URI, such as tls://0.0.0.0:8443?cert=..&key=..")
            .validator(validate_endpoint)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("destination")
            .help("Layered endpoint URI which every session dials")
            .validator(validate_endpoint)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(Command::new("drivers").about("List the registered transport drivers"))
    .subcommand(
      Command::new("cert")
        .about("Generate a self-signed certificate as hex-encoded driver parameters")
        .arg(
          Arg::new("san")
            .takes_value(true)
            .multiple_values(true)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();

  let log_level = matches.value_of("log-level").unwrap_or("info");
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  if let Err(err) = tracing::subscriber::set_global_default(collector) {
    eprintln!("Logger initialization failed: {}", err);
    std::process::exit(1);
  }

  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let outcome = tokio::runtime::Builder::new_multi_thread()
    .thread_name("stackcat-worker")
    .enable_all()
    .build()
    .context("Tokio runtime setup failure")
    .and_then(|rt| rt.block_on(main_args_handler(&matches)));
  match outcome {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(()) => tracing::debug!("{} exited successfully", mode),
  }
}

pub fn tunnel_arg_handling(args: &'_ ArgMatches) -> Result<tunnel::TunnelArgs> {
  let source_role = if args.is_present("connect-source") {
    EndpointRole::Dial
  } else {
    EndpointRole::Listen
  };
  let handshake_timeout = parse_duration_secs(args.value_of("handshake-timeout").unwrap_or("30"))?;
  Ok(tunnel::TunnelArgs {
    source: parse_endpoint(args.value_of("source").unwrap_or_default(), source_role)
      .context("Invalid source endpoint")?,
    destination: parse_endpoint(
      args.value_of("destination").unwrap_or_default(),
      EndpointRole::Dial,
    )
    .context("Invalid destination endpoint")?,
    options: TunnelOptions {
      grace_period: parse_duration_secs(args.value_of("grace").unwrap_or("5"))?,
      handshake_timeout: Some(handshake_timeout).filter(|t| !t.is_zero()),
    },
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("tunnel", opts)) => {
      let config = tunnel_arg_handling(opts)?;
      tracing::debug!("Running tunnel with config {:#?}", config);
      tunnel::tunnel_main(config).await
    }
    Some(("drivers", _)) => {
      let registry = DriverRegistry::with_builtin_drivers()?;
      for name in registry.names() {
        println!("{}", name);
      }
      Ok(())
    }
    Some(("cert", opts)) => {
      let sans = opts
        .values_of("san")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();
      certgen::certgen_main(sans)
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
