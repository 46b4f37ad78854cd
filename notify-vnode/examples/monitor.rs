use notify_vnode::Watcher;
use std::path::PathBuf;

/// Prints the events for every path given on the command line
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        log::error!("Usage: monitor <path>...");
        std::process::exit(2);
    }

    if let Err(error) = watch(&paths) {
        log::error!("Error: {error:?}");
    }
}

fn watch(paths: &[PathBuf]) -> notify_vnode::Result<()> {
    let watcher = Watcher::new()?;

    for path in paths {
        log::info!("Watching {}", path.display());
        watcher.add(path)?;
    }

    let errors = watcher.errors().clone();
    std::thread::spawn(move || {
        for error in errors {
            log::error!("Error: {error}");
        }
    });

    for event in watcher.events() {
        log::info!("{event}");
    }

    Ok(())
}
