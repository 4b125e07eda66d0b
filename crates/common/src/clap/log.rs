use clap::{App, Arg, ArgMatches};
use tracing_subscriber::EnvFilter;

pub fn add_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("log_level")
            .long("log-level")
            .env("LOG_LEVEL")
            .value_name("LOG_LEVEL")
            .help("Log level")
            .default_value("INFO")
            .case_insensitive(true)
            .possible_values(&["TRACE", "DEBUG", "INFO", "WARN", "ERROR"])
            .required(true)
            .takes_value(true),
    )
}

/// Filter directives for the selected level. Transport libraries stay one step quieter
/// below `info`.
pub fn filter_directives(level: &str) -> String {
    let level = level.to_lowercase();
    match &level[..] {
        "trace" | "debug" => format!(
            "{},hyper=info,tokio_tungstenite=info,tungstenite=info",
            level
        ),
        _ => level,
    }
}

/// Install the global fmt subscriber.
pub fn extract_matches(matches: &ArgMatches<'_>) -> Result<(), anyhow::Error> {
    let level = matches.value_of("log_level").unwrap_or("INFO");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter_directives(level)))
        .try_init()
        .map_err(|e| anyhow::anyhow!("could not initialize logging: {}", e))
}
