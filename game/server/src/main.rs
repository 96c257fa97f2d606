mod config;

use config::ServerConfig;
use ember::logging::{self, Logger};
use std::env;
use std::io::BufRead;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tungsten::net::socket::NETWORK_STALL_TEST;
use tungsten::server::{DispatchHooks, Server, ServerOptions};

fn print_usage(program: &str) {
    println!("Usage: {} [options]", program);
    println!("Options:");
    println!("  -p <port>       Listen port (default: {})", config::DEFAULT_PORT);
    println!("  -io <count>     IO thread count (default: 2)");
    println!("  -local <count>  Local thread count (default: {})", tungsten::MAX_LOCAL_THREADS);
    println!("  -config <path>  TOML configuration file");
    println!("  -h, --help      Show this help");
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    let parsed = value.and_then(|raw| raw.parse().ok());

    match parsed {
        Some(parsed) => parsed,
        None => {
            eprintln!("Invalid or missing value for {}", flag);
            process::exit(2);
        }
    }
}

fn load_config(args: &[String]) -> ServerConfig {
    let mut config = ServerConfig::default();

    // The config file is applied first so flags can override it.
    for (index, arg) in args.iter().enumerate() {
        if arg == "-config" {
            let path: String = parse_value("-config", args.get(index + 1));
            config = ServerConfig::load(path);
        }
    }

    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "-p" => {
                config.port = parse_value("-p", args.get(index + 1));
                index += 1;
            }
            "-io" => {
                config.io_threads = parse_value("-io", args.get(index + 1));
                index += 1;
            }
            "-local" => {
                config.local_threads = parse_value("-local", args.get(index + 1));
                index += 1;
            }
            "-config" => {
                index += 1;
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            other => {
                eprintln!("Unknown option {}", other);
                print_usage(&args[0]);
                process::exit(2);
            }
        }
        index += 1;
    }

    config
}

/// Console commands: `q` stops the server, `p` toggles the network-stall
/// simulation that lets send queues back up until the backpressure close
/// fires.
fn spawn_console(running: Arc<AtomicBool>, log: Logger) {
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();

            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };

                match line.trim() {
                    "q" | "Q" => {
                        running.store(false, Ordering::Release);
                        break;
                    }
                    "p" | "P" => {
                        let stalled = !NETWORK_STALL_TEST.load(Ordering::Relaxed);
                        NETWORK_STALL_TEST.store(stalled, Ordering::Relaxed);

                        if stalled {
                            logging::warn!(log, "network stall simulation started; send queues will back up");
                        } else {
                            logging::warn!(log, "network stall simulation ended");
                        }
                    }
                    _ => {}
                }
            }
        })
        .expect("Failed to spawn console thread");
}

struct AcceptWindow {
    last_accepts: u64,
    last_time: Instant,
}

fn log_stats(server: &Server, window: &mut AcceptWindow, log: &Logger) {
    let services = server.services();
    let manager = server.manager();

    logging::info!(log, "server stats";
                   "active_sessions" => services.registry.active_count(),
                   "local_threads" => manager.worker_count(),
                   "socket_slots" => services.sockets.slot_count(),
                   "pool_free" => services.pool.free_count(),
                   "pool_size" => services.pool.pool_size(),
                   "pool_used" => services.pool.used_count(),
                   "pool_max_used" => services.pool.max_used_count(),
                   "pool_double_releases" => services.pool.double_release_count());

    for shared in manager.worker_shareds() {
        let stats = shared.stats().snapshot();

        logging::info!(log, "worker stats";
                       "worker" => shared.id(),
                       "sessions" => shared.session_count(),
                       "max_sessions" => shared.max_sessions(),
                       "ticks" => stats.ticks,
                       "avg_tick_us" => stats.avg_tick_us(),
                       "max_tick_us" => stats.max_tick_us,
                       "packets" => stats.packets_processed,
                       "sent" => stats.packets_sent);
    }

    let connections = services.registry.connection_counts();
    logging::info!(log, "session states";
                   "total" => connections.total,
                   "active" => connections.connected,
                   "waiting" => connections.waiting);

    let reconnects = services.registry.reconnect_stats().snapshot();
    logging::info!(log, "reconnect stats";
                   "success" => reconnects.success,
                   "token_mismatch" => reconnects.fail_token_mismatch,
                   "not_found" => reconnects.fail_not_found,
                   "invalid_state" => reconnects.fail_invalid_state,
                   "expired" => reconnects.fail_expired);

    let elapsed = window.last_time.elapsed().as_secs_f64();
    if elapsed >= 0.1 {
        let accepts = server.listener_stats().accept_count();
        let accept_pps = (accepts - window.last_accepts) as f64 / elapsed;

        logging::info!(log, "accept throughput";
                       "accept_pps" => accept_pps,
                       "total_accepts" => accepts,
                       "total_rejects" => server.listener_stats().reject_count());

        window.last_accepts = accepts;
        window.last_time = Instant::now();
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let config = load_config(&args);

    let log = logging::init();

    logging::info!(log, "high-throughput session server";
                   "port" => config.port,
                   "io_threads" => config.io_threads,
                   "local_threads" => config.local_threads,
                   "max_sessions" => tungsten::MAX_TOTAL_SESSIONS);

    let options = ServerOptions {
        addr: format!("0.0.0.0:{}", config.port)
            .parse()
            .expect("Listen address must parse"),
        io_threads: config.io_threads,
        local_threads: config.local_threads,
        pool_init: config.pool_init,
    };

    let mut server = match Server::start(options, DispatchHooks::new(), &log) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(log, "failed to start server"; "error" => %err);
            process::exit(1);
        }
    };

    logging::info!(log, "server ready; console commands: q = quit, p = toggle network stall");

    let running = Arc::new(AtomicBool::new(true));
    spawn_console(running.clone(), log.clone());

    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));
    let mut window = AcceptWindow {
        last_accepts: 0,
        last_time: Instant::now(),
    };
    let mut last_tick = Instant::now();
    let mut last_stats = Instant::now();

    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));

        let delta_ms = last_tick.elapsed().as_millis() as u64;
        last_tick = Instant::now();

        server.services().monitor.update(delta_ms);

        if last_stats.elapsed() >= stats_interval {
            log_stats(&server, &mut window, &log);
            last_stats = Instant::now();
        }
    }

    logging::info!(log, "shutting down");
    server.stop();
}
