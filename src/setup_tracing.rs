use time::format_description::parse;
use tracing_subscriber::{fmt::time::OffsetTime, EnvFilter};

use crate::cli::Commands;

/// Filters applied on top of the default level to quiet chatty dependencies.
const QUIET_TARGETS: [&str; 3] = [
    "sqlx::postgres::notice=warn",
    "sea_orm_migration::migrator=warn",
    "tower_http=info",
];

pub fn setup_tracing_for_command(command: &Option<Commands>, server_log_level: &str) {
    // One-shot commands stay quiet; the server logs at its configured level.
    // RUST_LOG overrides both.
    let default_level = match command {
        Some(Commands::Migrate { .. }) => "warn",
        Some(Commands::Version) => "error",
        Some(Commands::Serve) | None => server_log_level,
    };

    let env_filter = QUIET_TARGETS.iter().fold(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        |filter, directive| match directive.parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    );

    let timer = parse("[hour]:[minute]:[second].[subsecond digits:2]")
        .map(|format| {
            OffsetTime::new(
                time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC),
                format,
            )
        });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_ansi(true)
        .compact();

    match timer {
        Ok(timer) => builder.with_timer(timer).init(),
        Err(_) => builder.init(),
    }
}
