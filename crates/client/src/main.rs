#![warn(rust_2018_idioms)]

#[macro_use]
extern crate tracing;

use anyhow::Context;
use clap::{crate_version, App, Arg};
use relaytun_client::backoff::{Backoff, MAX_DELAY};
use relaytun_client::{ClientConfig, TunnelClient};
use relaytun_common::clap as clap_helpers;
use std::time::Instant;
use tokio::runtime::Builder;

fn main() -> anyhow::Result<()> {
    let spawn_args = App::new("spawn")
        .about("Expose a local service through a relay hub")
        .arg(
            Arg::with_name("relay_url")
                .long("relay-url")
                .value_name("URL")
                .env("RELAYTUN_RELAY_URL")
                .required(true)
                .help("Set hub tunnel listener URL, e.g. wss://relay.example.com:8081")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("node_id")
                .long("node-id")
                .value_name("STRING")
                .env("RELAYTUN_NODE_ID")
                .required(true)
                .help("Register under this node id")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("local_url")
                .long("local-url")
                .value_name("URL")
                .default_value("http://127.0.0.1:3000")
                .required(true)
                .help("Set local service base URL")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("auth_token")
                .long("auth-token")
                .value_name("TOKEN")
                .env("RELAYTUN_AUTH_TOKEN")
                .required(false)
                .help("Bearer token presented to the hub")
                .takes_value(true),
        );

    let spawn_args =
        clap_helpers::tunnel::add_args(clap_helpers::log::add_args(spawn_args));

    let matches = App::new("Relaytun Client")
        .version(crate_version!())
        .author("Relaytun Team")
        .subcommand(spawn_args)
        .get_matches();

    let matches = matches
        .subcommand_matches("spawn")
        .context("unknown subcommand")?;

    clap_helpers::log::extract_matches(matches)?;
    let settings = clap_helpers::tunnel::extract_matches(matches)?;

    let relay_url = matches
        .value_of("relay_url")
        .context("no relay URL provided")?;
    let local_url = matches
        .value_of("local_url")
        .context("no local URL provided")?;
    let node_id = matches
        .value_of("node_id")
        .context("no node id provided")?;
    let auth_token = matches.value_of("auth_token").unwrap_or("").to_string();

    let mut config = ClientConfig::new(
        relay_url
            .parse()
            .with_context(|| format!("bad relay URL `{}`", relay_url))?,
        node_id,
        local_url
            .parse()
            .with_context(|| format!("bad local URL `{}`", local_url))?,
    );
    config.settings = settings;
    config.tunnel_url()?;

    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name("client-reactor")
        .build()?;

    rt.block_on(async move {
        let client = TunnelClient::new(config);

        tokio::spawn({
            let client = client.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("ctrl-c received, stopping"),
                    Err(e) => error!("could not listen for ctrl-c: {}", e),
                }
                client.stop();
            }
        });

        let mut backoff = Backoff::default();

        loop {
            let started_at = Instant::now();

            match client.start(&auth_token).await {
                Ok(()) => break,
                Err(e) => {
                    // a session that stayed up for a while starts the backoff over
                    if started_at.elapsed() > MAX_DELAY {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    warn!("tunnel error: {}. reconnect in {:?}", e, delay);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {},
                        _ = client.stopped() => break,
                    }
                }
            }
        }

        info!("client stopped");
        Ok(())
    })
}

