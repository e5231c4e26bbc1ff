//! The `tunwire` executable: argument parsing, configuration loading,
//! signal wiring, and post-up/pre-down script execution around the
//! orchestrator's `init`/`run`/`stop` lifecycle. All out of scope for the
//! engine itself per spec.md §1 ("CLI, signal wiring and post-up/pre-down
//! script execution"); grounded in `hev_socks5_tunnel_main`'s role as seen
//! from `hev-socks5-tunnel.c`'s public API, with the `SIGPIPE` ignore at
//! `hev_socks5_tunnel_run` carried over verbatim.

use std::process::{Command, ExitCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use tunwire::config::Config;
use tunwire::orchestrator::Orchestrator;
use tunwire::socks5::DirectSocks5Client;
use tunwire::tun_device::LinuxTunDevice;

#[derive(Parser, Debug)]
#[command(name = "tunwire", about = "User-space TCP/IP gateway that proxies TUN traffic through a SOCKS5 server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/tunwire/tunwire.toml")]
    config: String,
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install `SIGINT`/`SIGTERM` handlers that only flip an atomic flag (async-
/// signal-safe), and ignore `SIGPIPE` process-wide per spec.md §6.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as usize);
        libc::signal(libc::SIGTERM, request_shutdown as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn run_script(label: &str, script: &Option<String>) {
    let Some(script) = script else { return };
    tracing::info!(script, "running {label} script");
    match Command::new("/bin/sh").arg("-c").arg(script).status() {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(%status, "{label} script exited non-zero"),
        Err(err) => tracing::warn!(%err, "failed to spawn {label} script"),
    }
}

fn main() -> ExitCode {
    tunwire::logging::init();
    install_signal_handlers();

    let args = Args::parse();
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, path = %args.config, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let device = match LinuxTunDevice::open(&config.tunnel.tunnel_name, config.tunnel.tunnel_mtu) {
        Ok(device) => device,
        Err(err) => {
            tracing::error!(%err, "failed to open tun device");
            return ExitCode::FAILURE;
        }
    };

    run_script("post-up", &config.tunnel.post_up_script);

    let socks5 = Arc::new(DirectSocks5Client::new(config.tunnel.socks5_server));
    let orchestrator = match Orchestrator::init(device, config.tunnel.clone(), socks5) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(err) => {
            tracing::error!(%err, "failed to initialize tunnel");
            run_script("pre-down", &config.tunnel.pre_down_script);
            return ExitCode::FAILURE;
        }
    };

    let watcher = {
        let orchestrator = orchestrator.clone();
        thread::Builder::new()
            .name("tunwire-signal-watcher".into())
            .spawn(move || {
                while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(100));
                }
                orchestrator.stop();
            })
            .expect("failed to spawn signal watcher thread")
    };

    let result = orchestrator.run();

    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    run_script("pre-down", &config.tunnel.pre_down_script);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "tunnel exited with an error");
            ExitCode::FAILURE
        }
    }
}
