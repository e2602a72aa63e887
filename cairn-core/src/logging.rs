use std::path::Path;

/// Initialise the global logger.
///
/// `RUST_LOG` still wins over the level chosen here. When `log_file` is set
/// but cannot be opened, logs go to stderr instead.
pub fn init(debug: bool, log_file: Option<&Path>) {
    use env_logger::Target;
    use std::fs;
    use std::io;

    let target = match log_file {
        Some(path) => (|| -> io::Result<Target> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Target::Pipe(Box::new(file)))
        })()
        .unwrap_or(Target::Stderr),
        None => Target::Stderr,
    };

    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(target)
        .try_init();
}
