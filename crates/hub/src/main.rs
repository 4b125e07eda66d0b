#![warn(rust_2018_idioms)]

#[macro_use]
extern crate tracing;

use anyhow::Context;
use clap::{crate_version, App, Arg, ArgMatches};
use futures::FutureExt;
use relaytun_common::clap as clap_helpers;
use relaytun_hub::{AllowAll, NodeAuthenticator, RelayHub, SharedToken, SubdomainResolver};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

fn socket_addr(matches: &ArgMatches<'_>, name: &str) -> anyhow::Result<SocketAddr> {
    let value = matches
        .value_of(name)
        .with_context(|| format!("no {} provided", name))?;
    value
        .parse()
        .with_context(|| format!("failed to parse {} (ip:port): `{}`", name, value))
}

fn main() -> anyhow::Result<()> {
    let spawn_args = App::new("spawn")
        .about("Run the relay hub")
        .arg(
            Arg::with_name("listen_edge")
                .long("listen-edge")
                .value_name("SOCKET_ADDR")
                .default_value("0.0.0.0:8080")
                .required(true)
                .help("Set public HTTP listen address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen_tunnel")
                .long("listen-tunnel")
                .value_name("SOCKET_ADDR")
                .default_value("0.0.0.0:8081")
                .required(true)
                .help("Set tunnel registration listen address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen_int")
                .long("listen-int")
                .value_name("SOCKET_ADDR")
                .default_value("127.0.0.1:9090")
                .required(true)
                .help("Set internal listen address serving /metrics")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("base_domain")
                .long("base-domain")
                .value_name("DOMAIN")
                .env("RELAYTUN_BASE_DOMAIN")
                .required(true)
                .help("Edge requests for <node>.<base-domain> are routed to <node>")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("auth_token")
                .long("auth-token")
                .value_name("TOKEN")
                .env("RELAYTUN_AUTH_TOKEN")
                .required(false)
                .help("Bearer token nodes must present. Any node is accepted when unset")
                .takes_value(true),
        );

    let spawn_args =
        clap_helpers::tunnel::add_args(clap_helpers::log::add_args(spawn_args));

    let matches = App::new("Relaytun Hub")
        .version(crate_version!())
        .author("Relaytun Team")
        .subcommand(spawn_args)
        .get_matches();

    let matches = matches
        .subcommand_matches("spawn")
        .context("unknown subcommand")?;

    clap_helpers::log::extract_matches(matches)?;
    let settings = clap_helpers::tunnel::extract_matches(matches)?;

    let listen_edge_addr = socket_addr(matches, "listen_edge")?;
    let listen_tunnel_addr = socket_addr(matches, "listen_tunnel")?;
    let listen_int_addr = socket_addr(matches, "listen_int")?;
    let base_domain = matches
        .value_of("base_domain")
        .context("no base domain provided")?
        .to_string();

    let authenticator: Arc<dyn NodeAuthenticator> = match matches.value_of("auth_token") {
        Some(token) => Arc::new(SharedToken::new(token)),
        None => {
            warn!("no auth token configured, accepting any node");
            Arc::new(AllowAll)
        }
    };

    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name("hub-reactor")
        .build()?;

    rt.block_on(async move {
        let hub = RelayHub::new(settings);
        let stop = CancellationToken::new();

        tokio::spawn({
            let stop = stop.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("ctrl-c received, stopping"),
                    Err(e) => error!("could not listen for ctrl-c: {}", e),
                }
                stop.cancel();
            }
        });

        let shutdown = |name: &'static str| {
            let stop = stop.clone();
            async move { stop.cancelled().await }
                .map(move |()| info!("{} server stop request received", name))
        };

        let (int_addr, int_server) =
            relaytun_hub::int_server::bind(listen_int_addr, shutdown("internal"))?;
        info!("Listening internal HTTP on {}", int_addr);

        let (tunnel_addr, tunnel_server) = relaytun_hub::registration::bind(
            listen_tunnel_addr,
            hub.clone(),
            authenticator,
            shutdown("tunnel"),
        )?;
        info!("Listening tunnel registrations on {}", tunnel_addr);

        let (edge_addr, edge_server) = relaytun_hub::edge::bind(
            listen_edge_addr,
            hub.clone(),
            Arc::new(SubdomainResolver::new(&base_domain)),
            shutdown("edge"),
        )?;
        info!("Listening edge HTTP on {} for *.{}", edge_addr, base_domain);

        let int_server = tokio::spawn(int_server);
        let tunnel_server = tokio::spawn(tunnel_server);

        if let Err(e) = edge_server.await {
            error!("edge server error: {}", e);
        }

        stop.cancel();
        let _ = tunnel_server.await;
        let _ = int_server.await;

        hub.shutdown().await;
        info!("hub stopped");

        Ok(())
    })
}
