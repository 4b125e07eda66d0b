use crate::settings::TunnelSettings;
use anyhow::Context;
use clap::{App, Arg, ArgMatches};
use std::str::FromStr;
use std::time::Duration;

pub fn add_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("frame_timeout")
            .long("frame-timeout")
            .env("TUNNEL_FRAME_TIMEOUT")
            .value_name("SECONDS")
            .help("Bound on every frame write and every wait for the next frame")
            .default_value("10")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("exchange_timeout")
            .long("exchange-timeout")
            .env("TUNNEL_EXCHANGE_TIMEOUT")
            .value_name("SECONDS")
            .help("Bound on an exchange until its response head")
            .default_value("60")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("fragment_size")
            .long("fragment-size")
            .env("TUNNEL_FRAGMENT_SIZE")
            .value_name("BYTES")
            .help("Maximum body bytes per frame")
            .default_value("524288")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("write_queue_depth")
            .long("write-queue-depth")
            .value_name("FRAMES")
            .help("Outbound frames buffered per connection")
            .default_value("128")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("exchange_queue_depth")
            .long("exchange-queue-depth")
            .value_name("FRAMES")
            .help("Inbound frames buffered per exchange")
            .default_value("64")
            .takes_value(true),
    )
}

fn parse_arg<T>(matches: &ArgMatches<'_>, name: &str, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match matches.value_of(name) {
        Some(value) => value
            .parse()
            .with_context(|| format!("bad value for {}: `{}`", name, value)),
        None => Ok(default),
    }
}

pub fn extract_matches(matches: &ArgMatches<'_>) -> Result<TunnelSettings, anyhow::Error> {
    let defaults = TunnelSettings::default();

    let fragment_size = parse_arg(matches, "fragment_size", defaults.fragment_size)?;
    if fragment_size == 0 || fragment_size > crate::codec::MAX_DATA_LEN {
        anyhow::bail!("fragment size must be within 1..={}", crate::codec::MAX_DATA_LEN);
    }

    Ok(TunnelSettings {
        frame_timeout: Duration::from_secs(parse_arg(
            matches,
            "frame_timeout",
            defaults.frame_timeout.as_secs(),
        )?),
        exchange_timeout: Duration::from_secs(parse_arg(
            matches,
            "exchange_timeout",
            defaults.exchange_timeout.as_secs(),
        )?),
        fragment_size,
        write_queue_depth: parse_arg(matches, "write_queue_depth", defaults.write_queue_depth)?,
        exchange_queue_depth: parse_arg(
            matches,
            "exchange_queue_depth",
            defaults.exchange_queue_depth,
        )?,
    })
}
