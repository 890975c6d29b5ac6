//! Process-wide logger setup. Verbose (trace/debug) under `-d`, warn-level only otherwise.

pub fn init(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
