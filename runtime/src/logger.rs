use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

struct Logger;

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let time = humantime::format_rfc3339_millis(SystemTime::now());

		let color = match record.level() {
			Level::Trace => Color::Purple,
			Level::Debug => Color::Blue,
			Level::Info => Color::Green,
			Level::Warn => Color::Yellow,
			Level::Error => Color::Red,
		};

		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			color.bold().prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}

/// Installs the stderr logger. The level defaults to `info` and can be
/// overridden through the `COAP_LOG` environment variable.
pub fn init() {
	let level = std::env::var("COAP_LOG")
		.ok()
		.and_then(|v| v.parse::<LevelFilter>().ok())
		.unwrap_or(LevelFilter::Info);

	if log::set_boxed_logger(Box::new(Logger)).is_ok() {
		log::set_max_level(level);
	}
}
