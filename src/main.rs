//! pproxy - Papyrus debug adapter proxy.
//!
//! Sits between a Debug Adapter Protocol client (VSCode, etc.) and the
//! game's Papyrus debug server, translating the server's partial dialect
//! into something a standards-compliant client can work with.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use papyrus_proxy::args::Args;
use papyrus_proxy::script::FsScriptLookup;
use papyrus_proxy::session::{Session, SessionConfig};
use papyrus_proxy::tracer::FileTracer;
use papyrus_proxy::transport::{self, FramedReader};
use serde_json::Value;
use std::io::BufRead;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

/// One inbound stimulus for the session pump. The two reader threads and
/// the deadline timer all funnel through here, so the session itself stays
/// single-threaded.
enum PumpEvent {
    Client(Value),
    Server(Value),
    ClientClosed,
    ServerClosed,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "proxy", "pproxy listening on {addr}");

    let tracer = match &args.log_file {
        Some(path) => Some(FileTracer::new(path)?),
        None => None,
    };
    if args.trace_dap && tracer.is_none() {
        warn!(target: "proxy", "--trace-dap requires --log-file; tracing disabled");
    }
    let wire_tracer = if args.trace_dap { tracer.clone() } else { None };

    // Accept clients sequentially. One client == one debug session == one
    // fresh connection to the game.
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "proxy", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "proxy", "DAP client connected: {peer}");
        if let Some(t) = &tracer {
            t.line(&format!("client connected: {peer}"));
        }

        let res = run_session(&args, stream, wire_tracer.clone());
        if let Err(err) = res {
            warn!(target: "proxy", "session ended with error: {err:#}");
            if let Some(t) = &tracer {
                t.line(&format!("session error: {err:#}"));
            }
        } else if let Some(t) = &tracer {
            t.line("session finished OK");
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}

fn run_session(args: &Args, client: TcpStream, tracer: Option<FileTracer>) -> anyhow::Result<()> {
    let server = TcpStream::connect(&args.remote)
        .with_context(|| format!("connect to debug server at {}", args.remote))?;
    info!(target: "proxy", "connected to debug server at {}", args.remote);

    let (client_reader, client_writer) = transport::split_tcp(&client, tracer.clone(), "client")?;
    let (server_reader, server_writer) = transport::split_tcp(&server, tracer, "server")?;

    let (events_tx, events_rx) = mpsc::channel();
    spawn_reader(client_reader, events_tx.clone(), PumpEvent::Client, PumpEvent::ClientClosed);
    spawn_reader(server_reader, events_tx, PumpEvent::Server, PumpEvent::ServerClosed);

    let mut session = Session::new(
        Box::new(client_writer),
        Box::new(server_writer),
        Box::new(FsScriptLookup),
        SessionConfig {
            workspace: args.workspace.clone(),
            base_scripts: args.base_scripts.clone(),
        },
    );

    loop {
        let event = match session.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match events_rx.recv_timeout(wait) {
                    Ok(event) => Some(event),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match events_rx.recv() {
                Ok(event) => Some(event),
                Err(mpsc::RecvError) => break,
            },
        };
        let now = Instant::now();
        let alive = match event {
            Some(PumpEvent::Client(message)) => session.handle_client_message(message, now)?,
            Some(PumpEvent::Server(message)) => session.handle_server_message(message, now)?,
            Some(PumpEvent::ClientClosed) => {
                info!(target: "proxy", "DAP client disconnected");
                break;
            }
            Some(PumpEvent::ServerClosed) => session.handle_server_closed()?,
            None => session.expire_due(now)?,
        };
        if !alive {
            break;
        }
    }
    Ok(())
}

/// Pump one framed connection into the session channel until EOF or error.
fn spawn_reader<R>(
    mut reader: FramedReader<R>,
    events: mpsc::Sender<PumpEvent>,
    wrap: fn(Value) -> PumpEvent,
    closed: PumpEvent,
) where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        loop {
            match reader.read_message() {
                Ok(message) => {
                    if events.send(wrap(message)).is_err() {
                        return;
                    }
                }
                Err(_) => {
                    // EOF and framing errors both end the connection
                    let _ = events.send(closed);
                    return;
                }
            }
        }
    });
}
