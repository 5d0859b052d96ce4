// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use clap::Parser;
use dotenv::dotenv;
use framelink::network::{
    is_reserved_type, ConnectCallback, ConnectionOwner, DataPacket, ResponseCallback,
};
use framelink::{
    setup_tracing, AppConfig, AppResult, Connection, IncomingConnectionListener,
    NetworkManager, SocketNetworkSystem, GLOBAL_CONFIG,
};
use tokio::runtime;
use tracing::{error, info, warn};

/// Packet type used by `ping`.
const PING_PACKET: u32 = 1;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log file
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// run an echo server on the configured address
    Serve,
    /// send messages to a server and wait for every response
    Ping {
        /// target, e.g. `(Socket)direct:127.0.0.1:9090`
        #[arg(long)]
        target: Option<String>,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    PrintConfig,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = setup_tracing(&commandline.log_dir, log_level(commandline.verbose))?;

    //setup config
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let app_config = AppConfig::set_up_config(config_path)?;
    let app_config = GLOBAL_CONFIG.get_or_init(|| app_config);

    match commandline.command.unwrap_or(Command::Serve) {
        Command::PrintConfig => {
            println!("{:#?}", app_config);
            Ok(())
        }
        Command::Serve => run(app_config, |manager| {
            let server = EchoServer::new();
            let address = format!(
                "(Socket)direct:{}:{}",
                app_config.server.ip, app_config.server.port
            );
            let listening = manager.listen(server.clone(), &address)?;
            info!("echo server on {}", listening.friendly_identifier());
            // the socket system owns both the listening connection and the
            // server until shutdown, so serving only ends on ctrl-c
            Ok(Box::new(|| false))
        }),
        Command::Ping { target, count } => run(app_config, |manager| {
            let target = target.unwrap_or_else(|| {
                let ip = match app_config.server.ip.as_str() {
                    "ANY" => "127.0.0.1",
                    ip => ip,
                };
                format!("(Socket)direct:{}:{}", ip, app_config.server.port)
            });
            let ping = Arc::new(Ping {
                count,
                answered: AtomicUsize::new(0),
            });
            let on_connect: ConnectCallback = {
                let ping = ping.clone();
                Arc::new(move |connection: &Arc<Connection>| ping.send_all(connection))
            };
            let connection = manager.connect(&target, Some(on_connect), None)?;
            Ok(Box::new(move || {
                if ping.answered.load(Ordering::Acquire) >= ping.count {
                    info!("{} responses received", ping.count);
                    connection.disconnect();
                    return true;
                }
                false
            }))
        }),
    }
}

/// Polled after every manager tick; `true` ends the loop.
type Finished = Box<dyn FnMut() -> bool>;

/// Drives `NetworkManager::update` on a current thread runtime until the
/// command finishes or ctrl-c arrives.
fn run<F>(config: &AppConfig, setup: F) -> AppResult<()>
where
    F: FnOnce(&Arc<NetworkManager>) -> AppResult<Finished>,
{
    let manager = NetworkManager::new(&config.network);
    let system = SocketNetworkSystem::new(
        manager.clone(),
        config.poller.clone(),
        &config.connection,
    );
    manager.install_system(system.clone(), true)?;
    manager.start()?;

    let mut finished = match setup(&manager) {
        Ok(finished) => finished,
        Err(e) => {
            manager.shutdown();
            return Err(e);
        }
    };
    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async {
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    manager.update();
                    if finished() {
                        break;
                    }
                }
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        error!("failed to listen for ctrl-c: {}", e);
                    }
                    info!("shutting down");
                    break;
                }
            }
        }
    });
    manager.shutdown();
    drop(system);
    Ok(())
}

struct EchoServer {
    self_ref: Weak<EchoServer>,
    accepted: AtomicUsize,
}

impl EchoServer {
    fn new() -> Arc<EchoServer> {
        Arc::new_cyclic(|self_ref| EchoServer {
            self_ref: self_ref.clone(),
            accepted: AtomicUsize::new(0),
        })
    }
}

impl IncomingConnectionListener for EchoServer {
    fn incoming_connection(&self, connection: &Arc<Connection>) {
        let total = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "client {} connected ({} so far)",
            connection.friendly_identifier(),
            total
        );
        let owner: Weak<dyn ConnectionOwner> = self.self_ref.clone();
        connection.set_owner(owner);
    }
}

impl ConnectionOwner for EchoServer {
    fn received_packet(&self, connection: &Arc<Connection>, packet: &Arc<DataPacket>) {
        if packet.is_labelled_packet() {
            let label = packet.label().unwrap_or_default();
            connection.send_labelled_response(
                packet,
                &label,
                packet.data_after_label(),
                false,
                false,
            );
        } else if !is_reserved_type(packet.packet_type()) {
            connection.send_data_response(packet, packet.payload(), false, false);
        }
    }

    fn connection_dropped(&self, connection: &Arc<Connection>) {
        info!("client {} left", connection.friendly_identifier());
    }
}

struct Ping {
    count: usize,
    answered: AtomicUsize,
}

impl Ping {
    fn send_all(self: &Arc<Self>, connection: &Arc<Connection>) {
        for i in 0..self.count {
            let ping = self.clone();
            let started = Instant::now();
            let on_response: ResponseCallback =
                Box::new(move |_: &Arc<Connection>, response: &Arc<DataPacket>| {
                    info!(
                        "response {} ({} bytes) after {:?}",
                        i,
                        response.size(),
                        started.elapsed()
                    );
                    ping.answered.fetch_add(1, Ordering::AcqRel);
                });
            let message = format!("ping {}", i);
            if let Err(e) =
                connection.send_message(PING_PACKET, &message, Some(on_response), false)
            {
                warn!("unable to send {}: {}", message, e);
            }
        }
    }
}
