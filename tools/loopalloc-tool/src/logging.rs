use log::LevelFilter;

/// Logs go to stderr so stdout stays machine-readable. `RUST_LOG` wins over
/// the default level.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}
