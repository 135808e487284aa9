use std::fmt::Display;

use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter};

pub fn init_logger() {
    fern::Dispatch::new()
        .format(|out, message, record| {
            let time = chrono::Local::now().format("%H:%M:%S");

            out.finish(format_args!(
                "{} {:>5} {:<7} {}",
                time.to_string().bright_black(),
                level_tag(record.level()),
                Target::of(record.target()),
                message
            ))
        })
        // Other crates only surface when something is actually wrong
        .level(LevelFilter::Warn)
        .level_for("soundbooth", LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()
        .expect("logging is initialized")
}

/// The part of the server a record came from, derived from the module
/// path of its target.
enum Target {
    Rooms,
    Peers,
    Gateway,
    Server,
    External(String),
}

impl Target {
    fn of(target: &str) -> Self {
        let mut path = target.split("::");
        let root = path.next().unwrap_or_default();

        if root != "soundbooth" {
            return Self::External(root.to_string());
        }

        match path.next() {
            Some("rooms") => Self::Rooms,
            Some("peer") => Self::Peers,
            Some("gateway") | Some("session") => Self::Gateway,
            // main, server, auth, track and the rest speak for the
            // server as a whole
            _ => Self::Server,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Target::Rooms => "rooms".bright_purple(),
            Target::Peers => "peers".bright_cyan(),
            Target::Gateway => "gateway".bright_green(),
            Target::Server => "server".blue(),
            Target::External(name) => name.as_str().normal(),
        };

        Display::fmt(&label, f)
    }
}

fn level_tag(level: Level) -> ColoredString {
    match level {
        Level::Error => "error".red().bold(),
        Level::Warn => "warn".yellow().bold(),
        Level::Info => "info".blue(),
        Level::Debug => "debug".white().dimmed(),
        Level::Trace => "trace".normal(),
    }
}
