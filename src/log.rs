//! Logging setup.
//!
//! An `env_logger` formatter that stays panic-free when a record has no
//! file/line (release builds can strip those).

use std::io::Write;

use env_logger::Builder;

pub fn init_log() {
    let mut builder = Builder::from_default_env();
    builder
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}
