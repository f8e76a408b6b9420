mod config;
mod wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use clap::Parser;
use tokio::io::AsyncWrite;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use nbsql_core::{CommandContext, NotebookCore, OutboxReceiver};
use nbsql_db::{CancelToken, EnvCredentials, PgDriver, SqlDriver};

use config::WorkerConfig;
use wire::{
    CANCEL_COMMAND, CancelRequest, LastCodec, RequestEnvelope, ResponseEnvelope, WireCodec,
    decode_request, encode_response, read_frame, write_frame,
};

#[derive(Debug, Parser)]
#[command(name = "nbsql-worker", about = "Framed stdio front end for the nbsql notebook core")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "NBSQL_CONFIG")]
    config: Option<PathBuf>,
    /// Requests handled concurrently before new ones are answered `Busy`.
    #[arg(long, default_value_t = 64)]
    max_in_flight: usize,
    /// Runtime worker threads; defaults to the available parallelism.
    #[arg(long)]
    threads: Option<usize>,
    /// Accepted for host compatibility; stdio is the only transport.
    #[arg(long)]
    stdio: bool,
}

type Outgoing = (WireCodec, ResponseEnvelope);

type InFlight = Arc<Mutex<HashMap<u64, CancelToken>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<u64, CancelToken>> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // stdout carries frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("NBSQL_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = WorkerConfig::load(args.config.as_deref())?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = args.threads.filter(|t| *t > 0) {
        builder.worker_threads(threads);
    }
    let runtime = builder.enable_all().build()?;
    runtime.block_on(serve(config, args.max_in_flight.max(1)))
}

async fn serve(config: WorkerConfig, max_in_flight: usize) -> anyhow::Result<()> {
    let profiles = Arc::new(config.profile_store()?);
    let driver: Arc<dyn SqlDriver> =
        Arc::new(PgDriver::new(config.pg_driver_config()).with_credentials(Arc::new(EnvCredentials)));
    let (core, events) = NotebookCore::start(config.core_config(), driver, profiles)?;
    let core = Arc::new(core);
    tracing::info!(
        connections = config.connections.len(),
        safety_profiles = config.safety_profiles.len(),
        max_in_flight,
        "worker ready"
    );

    let (response_tx, response_rx) = mpsc::unbounded_channel::<Outgoing>();
    let writer = tokio::spawn(write_loop(tokio::io::stdout(), response_rx));
    let last_codec = Arc::new(LastCodec::default());
    let (stop_events, stop_rx) = oneshot::channel();
    let forwarder = tokio::spawn(forward_events(
        events,
        stop_rx,
        response_tx.clone(),
        Arc::clone(&last_codec),
    ));

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let limiter = Arc::new(Semaphore::new(max_in_flight));
    let mut tasks = JoinSet::new();
    let mut stdin = tokio::io::stdin();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stdin) => frame,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                let _ = response_tx.send((
                    WireCodec::Json,
                    ResponseEnvelope::failure(0, "InvalidInput", err.to_string()),
                ));
                break;
            }
        };
        while tasks.try_join_next().is_some() {}

        let decoded = match decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                let _ = response_tx.send((
                    WireCodec::Json,
                    ResponseEnvelope::failure(0, "InvalidInput", err),
                ));
                continue;
            }
        };
        last_codec.store(decoded.wire);
        let wire = decoded.wire;
        let envelope = decoded.envelope;
        let request_id = envelope.request_id;

        if envelope.command == CANCEL_COMMAND {
            let _ = response_tx.send((wire, handle_cancel_request(&envelope, &in_flight)));
            continue;
        }
        let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
            let _ = response_tx.send((
                wire,
                ResponseEnvelope::failure(request_id, "Busy", "Worker queue full"),
            ));
            continue;
        };

        let cancel = CancelToken::new();
        lock(&in_flight).insert(request_id, cancel.clone());
        let core = Arc::clone(&core);
        let in_flight = Arc::clone(&in_flight);
        let response_tx = response_tx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let RequestEnvelope {
                command,
                payload,
                context,
                ..
            } = envelope;
            let ctx = CommandContext {
                session: context.session,
                profile: context.profile,
                cancel,
            };
            let reply = core.dispatcher().respond(&command, payload, &ctx).await;
            lock(&in_flight).remove(&request_id);
            let _ = response_tx.send((wire, ResponseEnvelope::reply(request_id, reply)));
        });
    }

    // Host went away: cancel what is still running and let it wind down.
    for token in lock(&in_flight).values() {
        token.cancel();
    }
    while tasks.join_next().await.is_some() {}
    let report = core.shutdown().await;
    for failure in &report.failures {
        tracing::warn!(?failure, "connection did not close cleanly");
    }
    // Deliver whatever the core posted before it stopped.
    let _ = stop_events.send(());
    drop(response_tx);
    let _ = forwarder.await;
    let _ = writer.await;
    Ok(())
}

/// Forwards outbound events until told to stop, then drains what is
/// already queued.
async fn forward_events(
    mut events: OutboxReceiver,
    mut stop: oneshot::Receiver<()>,
    response_tx: mpsc::UnboundedSender<Outgoing>,
    last_codec: Arc<LastCodec>,
) {
    let mut stopping = false;
    loop {
        let message = tokio::select! {
            message = events.recv() => message,
            _ = &mut stop, if !stopping => {
                events.close();
                stopping = true;
                continue;
            }
        };
        let Some(message) = message else {
            break;
        };
        match ResponseEnvelope::event(&message) {
            Ok(envelope) => {
                if response_tx.send((last_codec.load(), envelope)).is_err() {
                    break;
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode event"),
        }
    }
}

fn handle_cancel_request(envelope: &RequestEnvelope, in_flight: &InFlight) -> ResponseEnvelope {
    let cancel = match serde_json::from_value::<CancelRequest>(envelope.payload.clone()) {
        Ok(cancel) => cancel,
        Err(err) => {
            return ResponseEnvelope::failure(envelope.request_id, "InvalidInput", err.to_string());
        }
    };
    match lock(in_flight).get(&cancel.request_id) {
        Some(token) => {
            token.cancel();
            tracing::debug!(target_request = cancel.request_id, "request cancelled");
            ResponseEnvelope::ok(envelope.request_id, None)
        }
        None => ResponseEnvelope::failure(
            envelope.request_id,
            "NotFound",
            format!("no request {} in flight", cancel.request_id),
        ),
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut response_rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some((wire, response)) = response_rx.recv().await {
        let encoded = match encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded).await {
            tracing::error!(error = %err, "failed to write response");
            break;
        }
    }
}
