use std::fmt;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;

use crate::transport::message::Event;
use crate::utils::error::ClientError;

/// Shape of one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// WebSocket server URL, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// Concurrent connections to open.
    pub connections: usize,
    /// Messages sent on each connection, with counts `1..=messages`.
    pub messages: u64,
}

/// Aggregate results of a benchmark run.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub connections: usize,
    pub greetings: u64,
    pub replies: u64,
    pub elapsed: Duration,
    pub min_rtt: Duration,
    pub mean_rtt: Duration,
    pub max_rtt: Duration,
}

impl BenchReport {
    /// Folds per-connection round-trip samples into a report. Every entry
    /// of `samples` is one connection that received its greeting.
    pub fn from_samples(samples: &[Vec<Duration>], elapsed: Duration) -> Self {
        let all = samples.iter().flatten();
        let replies = all.clone().count() as u64;
        let total: Duration = all.clone().sum();
        let mean_rtt = if replies == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((total.as_nanos() / u128::from(replies)) as u64)
        };

        Self {
            connections: samples.len(),
            greetings: samples.len() as u64,
            replies,
            elapsed,
            min_rtt: all.clone().min().copied().unwrap_or_default(),
            mean_rtt,
            max_rtt: all.max().copied().unwrap_or_default(),
        }
    }

    /// Replies per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.replies as f64 / secs
        }
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connections: {}", self.connections)?;
        writeln!(f, "greetings:   {}", self.greetings)?;
        writeln!(f, "replies:     {}", self.replies)?;
        writeln!(f, "elapsed:     {:.3?}", self.elapsed)?;
        writeln!(f, "throughput:  {:.0} msg/s", self.throughput())?;
        write!(
            f,
            "round trip:  min {:.3?} / mean {:.3?} / max {:.3?}",
            self.min_rtt, self.mean_rtt, self.max_rtt
        )
    }
}

/// Runs every connection of `config` concurrently and reports once all of
/// them finished. The first failing connection fails the run.
pub async fn run_bench(config: &BenchConfig) -> Result<BenchReport, ClientError> {
    info!(
        url = %config.url,
        connections = config.connections,
        messages = config.messages,
        "Starting benchmark"
    );
    let started = Instant::now();

    let mut tasks = JoinSet::new();
    for _ in 0..config.connections {
        tasks.spawn(run_connection(config.url.clone(), config.messages));
    }

    let mut samples = Vec::with_capacity(config.connections);
    while let Some(joined) = tasks.join_next().await {
        samples.push(joined??);
    }

    Ok(BenchReport::from_samples(&samples, started.elapsed()))
}

async fn run_connection(url: String, messages: u64) -> Result<Vec<Duration>, ClientError> {
    let (mut ws_stream, _response) = connect_async(url.as_str()).await?;

    let greeting = next_event(&mut ws_stream).await?;
    expect_count(0, &greeting)?;

    let mut rtts = Vec::with_capacity(messages as usize);
    for count in 1..=messages {
        let sent = Instant::now();
        ws_stream
            .send(WsMessage::text(json!({ "c": count }).to_string()))
            .await?;
        let reply = next_event(&mut ws_stream).await?;
        rtts.push(sent.elapsed());
        expect_count(count, &reply)?;
    }

    // All replies are in; a failed close does not invalidate them.
    if let Err(e) = ws_stream.close(None).await {
        debug!(error = %e, "Close handshake failed");
    }
    Ok(rtts)
}

/// Reads until the next data frame and decodes it as an event.
pub(crate) async fn next_event<S>(ws: &mut S) -> Result<Event, ClientError>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg? {
            WsMessage::Text(text) => return Ok(Event::decode(text.as_bytes())?),
            WsMessage::Binary(data) => return Ok(Event::decode(&data)?),
            WsMessage::Close(_) => return Err(ClientError::ClosedEarly),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
    Err(ClientError::ClosedEarly)
}

fn expect_count(expected: u64, event: &Event) -> Result<(), ClientError> {
    if event.count == expected {
        Ok(())
    } else {
        Err(ClientError::UnexpectedCount {
            expected,
            actual: event.count,
        })
    }
}
