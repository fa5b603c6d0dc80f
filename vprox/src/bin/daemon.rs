use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, process, thread, time};

use vprox::config::Config;
use vprox::{listener, registry::VmRegistry, setup_panic_hook, VERSION};

fn print_help_exit(code: i32) -> ! {
    eprintln!("vprox version {}", VERSION);
    eprintln!("A command and I/O multiplexing proxy for sandboxed-VM workloads.");
    eprintln!("An optional TOML configuration file is read from the platform's standard config directory (vprox/vprox.toml). Only a single command line argument is supported: -socket-path=<path>, which overrides the configured socket path. All other settings must be set in the configuration file.");
    process::exit(code);
}

fn print_version() -> ! {
    eprintln!("{}", VERSION);
    process::exit(0);
}

/// Parse argv, returning a socket path override if `-socket-path=<path>`
/// was given. Exits the process on `--help`/`-h`/`--version`/`-v` or any
/// unrecognized argument, the way `liana::bin::daemon::parse_args` does
/// for its own single `--conf` flag.
fn parse_args(args: Vec<String>) -> Option<String> {
    if args.len() == 1 {
        return None;
    }
    if args.len() > 2 {
        eprintln!("Only a single command line argument is supported: -socket-path=<path>.");
        print_help_exit(1);
    }

    let arg = &args[1];
    if arg == "--help" || arg == "-h" {
        print_help_exit(0)
    } else if arg == "--version" || arg == "-v" {
        print_version()
    } else if let Some(path) = arg.strip_prefix("-socket-path=") {
        if path.is_empty() {
            eprintln!("-socket-path requires a non-empty value.");
            print_help_exit(1);
        }
        Some(path.to_string())
    } else {
        eprintln!("Only a single command line argument is supported: -socket-path=<path>.");
        print_help_exit(1);
    }
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][thread {}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                thread::current().name().unwrap_or("unnamed"),
                message
            ))
        })
        .level(log_level);

    dispatcher.chain(std::io::stdout()).apply()?;

    Ok(())
}

fn load_config(socket_path_override: Option<String>) -> Config {
    let mut config = match vprox::config::default_config_path() {
        Some(path) if path.exists() => Config::from_file(Some(path)).unwrap_or_else(|e| {
            eprintln!("Error parsing config: {}", e);
            print_help_exit(1);
        }),
        _ => Config::default(),
    };
    if let Some(path) = socket_path_override {
        config.socket_path = Some(path.into());
    }
    config
}

fn main() {
    setup_panic_hook();

    let args: Vec<String> = env::args().collect();
    let socket_path_override = parse_args(args);
    let config = load_config(socket_path_override);

    setup_logger(config.resolved_log_level()).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    log::info!("vprox {} starting up", VERSION);

    let socket_path = config.resolved_socket_path();
    let listen_socket = listener::acquire(&socket_path).unwrap_or_else(|e| {
        log::error!("Error acquiring listening socket: {}", e);
        process::exit(1);
    });

    let registry = Arc::new(VmRegistry::new());
    let config = Arc::new(config);
    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc_shutdown_hook(shutdown) {
            log::warn!("could not install shutdown signal handler: {}", e);
        }
    }

    listener::run(listen_socket, registry, config, shutdown);

    log::info!("vprox shut down cleanly");
}

/// Installs a `SIGINT`/`SIGTERM` handler that flips `shutdown`, using
/// the same raw `libc::signal` call the daemon already links `libc`
/// for (see `vprox::fdpass`).
fn ctrlc_shutdown_hook(shutdown: Arc<AtomicBool>) -> Result<(), String> {
    use std::sync::OnceLock;
    static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    SHUTDOWN_FLAG
        .set(shutdown)
        .map_err(|_| "shutdown hook already installed".to_string())?;

    extern "C" fn handle_signal(_: libc::c_int) {
        if let Some(flag) = SHUTDOWN_FLAG.get() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    unsafe {
        if libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t) == libc::SIG_ERR {
            return Err("failed to install SIGINT handler".to_string());
        }
        if libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t) == libc::SIG_ERR {
            return Err("failed to install SIGTERM handler".to_string());
        }
    }
    Ok(())
}
