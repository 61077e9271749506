//! Terminal logging for programs built on this crate.

use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use time::macros::format_description;

/// Send `log` output at or above `level` to stderr, with sub-second timestamps
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond]"
        ))
        .build();

    TermLogger::init(level, log_cfg, TerminalMode::Stderr, ColorChoice::Auto)?;
    Ok(())
}

/// Map a count of `-v` flags to a level
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[test]
fn test_level_for() {
    assert_eq!(level_for(0), LevelFilter::Warn);
    assert_eq!(level_for(2), LevelFilter::Debug);
    assert_eq!(level_for(9), LevelFilter::Trace);
}
