use std::env;

use redox_log::{OutputBuilder, RedoxLogger};

/// Environment variable overriding the stderr log level, e.g. `XHCI_LOG=trace`.
pub const LOG_LEVEL_VAR: &str = "XHCI_LOG";

pub fn output_level() -> log::LevelFilter {
    env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(log::LevelFilter::Info)
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Debug
}

/// Configures logging for a host controller process. Returns whether the logger was installed.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> bool {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    match OutputBuilder::in_redox_logging_scheme("usb", subcategory, format!("{logfile_base}.log"))
    {
        Ok(b) => {
            logger = logger.with_output(b.with_filter(file_level).flush_on_newline(true).build())
        }
        Err(error) => eprintln!("Failed to create {logfile_base}.log: {}", error),
    }

    match logger.enable() {
        Ok(_) => true,
        Err(error) => {
            eprintln!("{subcategory}: failed to set default logger: {}", error);
            false
        }
    }
}
