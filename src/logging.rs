use tracing_subscriber::EnvFilter;

/// Environment variable holding a full `EnvFilter` directive. Takes
/// precedence over the level passed on the command line.
pub const LOG_ENV: &str = "PLOTLINE_LOG";

/// Initialize the tracing subscriber. Output goes to stderr so it never
/// interleaves with streamed completion text on stdout.
///
/// `level` is a tracing level or filter directive; `off` installs nothing.
pub fn init_tracing(level: &str) {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive),
        Err(_) => {
            if level.eq_ignore_ascii_case("off") {
                return;
            }
            EnvFilter::try_new(level.to_lowercase())
        }
    }
    .unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
