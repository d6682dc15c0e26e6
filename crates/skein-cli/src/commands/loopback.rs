//! Loopback command
//!
//! Connects an initiator and an acceptor through an in-memory pipe, uploads
//! a payload on every stream and reports what it took.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Args;
use http::HeaderMap;
use serde::Serialize;
use skein_core::{DataFrame, HeadersFrame, SessionConfig};
use skein_session::{Role, Session, SessionListener, Stream, StreamListener};
use skein_transport::{pipe, spawn_session};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Number of concurrent streams
    #[arg(short, long, default_value = "4")]
    pub streams: usize,

    /// Bytes uploaded on each stream
    #[arg(short, long, default_value = "1048576")]
    pub bytes: usize,

    /// Maximum DATA frame size advertised by both sides
    #[arg(short, long)]
    pub frame_size: Option<u32>,

    /// Stream and connection window size for both sides
    #[arg(short, long)]
    pub window: Option<u32>,

    /// JSON config applied to both sides before the flags above
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct LoopbackStats {
    pub streams: usize,
    pub bytes_per_stream: usize,
    pub bytes_received: u64,
    pub elapsed_ms: f64,
    pub throughput_mib_s: f64,
    pub initiator_frames_in: u64,
    pub acceptor_frames_in: u64,
}

/// Counts uploaded bytes and finishes the stream once the upload ends
struct Receiver {
    received: Arc<AtomicU64>,
}

#[async_trait]
impl StreamListener for Receiver {
    async fn on_data(&self, stream: &Stream, frame: &DataFrame) {
        self.received
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        if frame.end_stream {
            let _ = stream.data(DataFrame::new(0, Bytes::new(), true)).await;
        }
    }
}

struct Acceptor {
    received: Arc<AtomicU64>,
}

#[async_trait]
impl SessionListener for Acceptor {
    async fn on_new_stream(
        &self,
        _stream: &Stream,
        _frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        Some(Arc::new(Receiver {
            received: self.received.clone(),
        }))
    }
}

/// Reports stream close to the driver
struct Uploader {
    done: mpsc::UnboundedSender<u32>,
}

#[async_trait]
impl StreamListener for Uploader {
    async fn on_close(&self, stream: &Stream) {
        let _ = self.done.send(stream.id());
    }
}

fn session_config(args: &LoopbackArgs) -> Result<SessionConfig> {
    let mut config = super::config::load(args.config.as_deref())?;
    if let Some(size) = args.frame_size {
        config = config.max_frame_size(size);
    }
    if let Some(window) = args.window {
        config = config.recv_window(window, window).send_window(window, window);
    }
    config.validate()?;
    Ok(config)
}

pub async fn loopback(args: &LoopbackArgs) -> Result<LoopbackStats> {
    let config = session_config(args)?;
    let received = Arc::new(AtomicU64::new(0));

    let ((a_sink, a_source), (b_sink, b_source)) = pipe(64);
    let (client, client_pump) = spawn_session(
        Session::builder(Role::Initiator).config(config.clone()),
        a_sink,
        a_source,
    )?;
    let (server, server_pump) = spawn_session(
        Session::builder(Role::Acceptor)
            .config(config)
            .listener(Arc::new(Acceptor {
                received: received.clone(),
            })),
        b_sink,
        b_source,
    )?;

    let started = Instant::now();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut uploads = Vec::with_capacity(args.streams);
    for _ in 0..args.streams {
        let stream = client
            .new_stream(
                HeadersFrame::request(HeaderMap::new(), false),
                Arc::new(Uploader {
                    done: done_tx.clone(),
                }),
            )
            .await?;
        let payload = Bytes::from(vec![0xa5; args.bytes]);
        uploads.push(stream.data(DataFrame::new(0, payload, true)));
    }
    for upload in uploads {
        upload.await?;
    }
    for _ in 0..args.streams {
        let id = done_rx.recv().await.context("Stream listener went away")?;
        debug!("Stream {} finished", id);
    }
    let elapsed = started.elapsed();

    client.shutdown();
    server.closed().await;
    let initiator_frames_in = client_pump.await??;
    let acceptor_frames_in = server_pump.await??;

    let bytes_received = received.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    Ok(LoopbackStats {
        streams: args.streams,
        bytes_per_stream: args.bytes,
        bytes_received,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        throughput_mib_s: bytes_received as f64 / (1024.0 * 1024.0) / secs,
        initiator_frames_in,
        acceptor_frames_in,
    })
}

pub async fn run(args: LoopbackArgs) -> Result<()> {
    info!(
        "Loopback: {} streams x {} bytes",
        args.streams, args.bytes
    );
    let stats = tokio::time::timeout(Duration::from_secs(args.timeout_secs), loopback(&args))
        .await
        .context("Loopback run timed out")??;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
