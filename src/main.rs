use std::collections::HashMap;
use std::io;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use majorq::broker::{Broker, Identity, Outbound};
use majorq::config::AppConfig;
use majorq::heartbeat::HeartbeatSchedule;
use majorq::logging::{LogLevel, Logger, LoggerConfig};
use majorq::protocol::{display_identity, Message};
use majorq::server::{PersistentConnection, TcpServer};
use majorq::shutdown::ShutdownHooks;
use majorq::wire::codec;

const REACTOR_IDLE_SLEEP: Duration = Duration::from_millis(20);
const READ_CHUNK_SIZE_BYTES: usize = 64 * 1024;

struct ConnectionSession {
    connection: Arc<PersistentConnection>,
    buffer: Vec<u8>,
}

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });

    let schedule = HeartbeatSchedule::from_app_config(&app_config, Utc::now())
        .unwrap_or_else(|error| {
            eprintln!("heartbeat configuration error: {error}");
            process::exit(2);
        });
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat schedule initialized",
        Some(json!({
            "interval_ms": app_config.heartbeat.interval_ms,
            "liveness_multiplier": app_config.heartbeat.liveness_multiplier
        })),
    );

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for clients and workers",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "host": app_config.server.host,
            "port": app_config.server.port
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut broker = Broker::new(schedule);
    let mut sessions: HashMap<Identity, ConnectionSession> = HashMap::new();

    while !shutdown_hooks.is_triggered() {
        if let Some(connection) = server.try_accept_persistent().unwrap_or_else(|error| {
            eprintln!("server accept error: {error}");
            process::exit(2);
        }) {
            logger.log(
                LogLevel::Info,
                Some("main::server"),
                "Accepted persistent connection",
                Some(json!({
                    "identity": connection.identity().to_string(),
                    "peer_addr": connection.peer_addr().to_string()
                })),
            );
            sessions.insert(
                connection.identity_frame(),
                ConnectionSession {
                    connection,
                    buffer: Vec::new(),
                },
            );
        }

        pump_connections(&mut sessions, &mut broker, &server, &logger);

        let now = Utc::now();
        if broker.heartbeat_due(now) {
            let outbound = broker.tick(now, &logger);
            deliver_outbound(outbound, &mut sessions, &server, &logger);
        }

        thread::sleep(REACTOR_IDLE_SLEEP);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, closing connections",
    );
    server.shutdown_all_connections();
    drop(server);
    logger.info(Some("main::shutdown"), "Broker stopped");
}

// Drains readable bytes from every connection, feeds complete messages to
// the broker, and writes whatever the broker wants sent. All broker state is
// touched from this thread only.
fn pump_connections(
    sessions: &mut HashMap<Identity, ConnectionSession>,
    broker: &mut Broker,
    server: &TcpServer,
    logger: &Logger,
) {
    let identities = sessions.keys().cloned().collect::<Vec<_>>();

    for identity in identities {
        let mut chunk = vec![0_u8; READ_CHUNK_SIZE_BYTES];
        let mut inbound: Vec<Message> = Vec::new();
        let mut close_reason: Option<String> = None;

        if let Some(session) = sessions.get_mut(&identity) {
            match session.connection.try_read(&mut chunk) {
                Ok(0) => {
                    close_reason = Some("peer closed the connection".to_owned());
                }
                Ok(size) => {
                    session.buffer.extend_from_slice(&chunk[..size]);
                    loop {
                        match codec::extract_message(&mut session.buffer) {
                            Ok(Some(frames)) => inbound.push(frames),
                            Ok(None) => break,
                            Err(error) => {
                                // A framing error leaves the byte stream
                                // unsynchronized; the connection cannot be
                                // recovered.
                                close_reason = Some(format!("wire framing error: {error}"));
                                break;
                            }
                        }
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    close_reason = Some(format!("socket read error: {error}"));
                }
            }
        }

        for frames in inbound {
            let now = Utc::now();
            let outbound = broker.handle_message(now, &identity, frames, logger);
            deliver_outbound(outbound, sessions, server, logger);
        }

        if let Some(reason) = close_reason {
            close_session(sessions, server, &identity, &reason, logger);
        }
    }
}

fn deliver_outbound(
    outbound: Vec<Outbound>,
    sessions: &mut HashMap<Identity, ConnectionSession>,
    server: &TcpServer,
    logger: &Logger,
) {
    for message in outbound {
        let Some(session) = sessions.get(&message.identity) else {
            logger.debug(
                Some("main::wire"),
                &format!(
                    "dropping outbound message for vanished connection {}",
                    display_identity(&message.identity)
                ),
            );
            continue;
        };

        let frame = match codec::encode_frame(&message.frames[1..]) {
            Ok(frame) => frame,
            Err(error) => {
                logger.warn(
                    Some("main::wire"),
                    &format!(
                        "failed to encode outbound message for {}: {error}",
                        display_identity(&message.identity)
                    ),
                );
                continue;
            }
        };

        if let Err(error) = session.connection.write_frame(&frame) {
            let reason = format!("socket write error: {error}");
            close_session(sessions, server, &message.identity, &reason, logger);
        }
    }
}

fn close_session(
    sessions: &mut HashMap<Identity, ConnectionSession>,
    server: &TcpServer,
    identity: &[u8],
    reason: &str,
    logger: &Logger,
) {
    let Some(session) = sessions.remove(identity) else {
        return;
    };

    logger.debug(
        Some("main::server"),
        &format!(
            "closing connection {}: {reason}",
            display_identity(identity)
        ),
    );
    let _ = session.connection.shutdown();
    server.drop_connection(session.connection.identity());
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: majorq is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;110m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                        _
  _ __ ___   __ _     (_)  ___   _ __   __ _
 | '_ ` _ \ / _` |    | | / _ \ | '__| / _` |
 | | | | | || (_| |   | || (_) || |   | (_| |
 |_| |_| |_| \__,_|  _/ | \___/ |_|    \__, |
                    |__/                  |_|"#;
    const APP_DESCRIPTION: &str =
        "Service-oriented request/reply broker with liveness-aware worker dispatch over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("MAJORQ_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
