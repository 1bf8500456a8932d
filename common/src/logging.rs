use chrono::Local;
use env_logger::fmt::Color;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

/// Installs the colored console logger used by every binary.
///
/// `RUST_LOG` still applies on top of the default `level`.
pub fn setup_logger(level: LevelFilter) {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            let mut timestamp_style = buf.style();
            let mut level_style = buf.style();
            let mut target_style = buf.style();
            let mut message_style = buf.style();

            let level_color = match record.level() {
                log::Level::Error => Color::Red,
                log::Level::Warn => Color::Yellow,
                log::Level::Info => Color::Green,
                log::Level::Debug => Color::Cyan,
                log::Level::Trace => Color::White,
            };

            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(
                buf,
                "{} {} [{}] {}",
                timestamp_style.set_color(Color::Rgb(100, 100, 100)).value(timestamp),
                level_style.set_color(level_color).value(record.level()),
                target_style.set_color(Color::Blue).value(record.target()),
                message_style.set_color(Color::White).value(record.args())
            )
        })
        .filter(None, level);

    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    // A second call (tests, embedded benchmark runs) keeps the first logger.
    let _ = builder.try_init();
}
