//! Load harness for the admission dispatcher.
//!
//! Opens simulated connections against an in-memory directory. Each one
//! binds with DIGEST-MD5 and then issues a run of searches. Halfway through,
//! the worker pool is resized. Reports throughput and latency percentiles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _};
use clap::Parser;
use hdrhistogram::Histogram;
use ldapd_core::{
    BindRequest, Dn, Entry, Filter, LdapResult, MessageId, Request, ResultCode, SearchRequest,
    SearchScope,
};
use ldapd_server::sasl::DigestMd5Client;
use ldapd_server::telemetry::init_tracing;
use ldapd_server::{
    Admission, AdmissionDispatcher, Backend, IdentityMapper, InMemoryDirectory, LoggingConfig,
    QueuePolicy, SaslConfig, ServerConfig, ServerContext, StoredPassword,
};
use tokio::sync::mpsc::UnboundedReceiver;

const REALM: &str = "harness.ldapd";
const SUFFIX: &str = "o=harness";

#[derive(Parser, Debug)]
#[command(name = "dispatch-harness")]
#[command(about = "Drive the ldapd admission dispatcher with simulated clients")]
struct Args {
    /// Simulated client connections
    #[arg(short, long, env = "LDAPD_HARNESS_CONNECTIONS", default_value_t = 32)]
    connections: usize,

    /// Searches issued by each connection after it binds
    #[arg(short, long, env = "LDAPD_HARNESS_SEARCHES", default_value_t = 200)]
    searches: usize,

    /// Initial worker thread count
    #[arg(short, long, env = "LDAPD_HARNESS_WORKERS", default_value_t = 4)]
    workers: u32,

    /// Worker count applied once half the searches are done
    #[arg(long, env = "LDAPD_HARNESS_RESIZE_TO", default_value_t = 16)]
    resize_to: u32,

    /// Bounded queue capacity; omit for an unbounded queue
    #[arg(long, env = "LDAPD_HARNESS_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Log filter directives
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    rejected: AtomicU64,
}

fn populate(directory: &InMemoryDirectory, users: usize) -> anyhow::Result<()> {
    let suffix = Dn::parse(SUFFIX)?;
    let people = Dn::parse(&format!("ou=people,{SUFFIX}"))?;
    directory.insert(Entry::new(suffix).with("objectClass", "organization"));
    directory.insert(Entry::new(people).with("objectClass", "organizationalUnit"));
    for n in 0..users {
        let uid = format!("user{n}");
        let dn = Dn::parse(&format!("uid={uid},ou=people,{SUFFIX}"))?;
        let stored = StoredPassword::digest_md5(&uid, REALM, &password_for(n));
        directory.insert(
            Entry::new(dn)
                .with("objectClass", "person")
                .with("uid", uid.clone())
                .with("cn", format!("Harness User {n}"))
                .with("userPassword", stored.encode()),
        );
    }
    Ok(())
}

fn password_for(n: usize) -> String {
    format!("secret-{n}")
}

async fn next_result(results: &mut UnboundedReceiver<LdapResult>) -> anyhow::Result<LdapResult> {
    results
        .recv()
        .await
        .ok_or_else(|| anyhow!("result channel closed"))
}

async fn run_client(
    dispatcher: Arc<AdmissionDispatcher>,
    index: usize,
    searches: usize,
    counters: Arc<Counters>,
) -> anyhow::Result<Histogram<u64>> {
    let mut latencies = Histogram::<u64>::new(3)?;
    let (connection, mut results) = dispatcher.open_connection(format!("harness-{index}"));
    let mut message_id = 0u32;
    let mut next_id = || {
        message_id += 1;
        MessageId(message_id)
    };

    dispatcher.submit(&connection, next_id(), Request::Bind(BindRequest::sasl("DIGEST-MD5", None)));
    let challenge = next_result(&mut results).await?;
    if challenge.code != ResultCode::SaslBindInProgress {
        bail!("connection {index}: expected a challenge, got {}", challenge.code);
    }
    let client = DigestMd5Client::new(format!("user{index}"), password_for(index), "localhost");
    let response = client.respond(challenge.server_sasl_credentials.as_deref().unwrap_or_default())?;
    dispatcher.submit(
        &connection,
        next_id(),
        Request::Bind(BindRequest::sasl("DIGEST-MD5", Some(response))),
    );
    let bound = next_result(&mut results).await?;
    if bound.code != ResultCode::Success {
        bail!("connection {index}: bind failed with {}", bound.code);
    }

    let base = Dn::parse(SUFFIX)?;
    for n in 0..searches {
        let filter = Filter::Equality("uid".into(), format!("user{}", (index + n) % 64));
        let request = Request::Search(SearchRequest::new(base.clone(), SearchScope::Subtree, filter));
        let started = Instant::now();
        if let Admission::Rejected(_) = dispatcher.submit(&connection, next_id(), request) {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        let result = next_result(&mut results).await?;
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let _ = latencies.record(micros);
        if result.code.is_success() {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    dispatcher.disconnect(&connection);
    Ok(latencies)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&LoggingConfig {
        filter: args.log_filter.clone(),
        json: args.json,
    });

    let directory = Arc::new(InMemoryDirectory::new());
    populate(&directory, args.connections)?;

    let config = ServerConfig {
        worker_threads: args.workers,
        admission: args
            .queue_capacity
            .map_or(QueuePolicy::Unbounded, |capacity| QueuePolicy::Bounded { capacity }),
        sasl: SaslConfig {
            realm: Some(REALM.to_string()),
            ..SaslConfig::default()
        },
        ..ServerConfig::default()
    };
    let backend: Arc<dyn Backend> = directory.clone();
    let identities: Arc<dyn IdentityMapper> = directory;
    let context = ServerContext::new(config, backend, identities);
    let dispatcher = Arc::new(AdmissionDispatcher::start(context).context("starting dispatcher")?);

    let counters = Arc::new(Counters::default());
    let total = (args.connections * args.searches) as u64;
    let started = Instant::now();

    let resizer = {
        let dispatcher = Arc::clone(&dispatcher);
        let counters = Arc::clone(&counters);
        let resize_to = args.resize_to;
        tokio::spawn(async move {
            while counters.completed.load(Ordering::Relaxed) < total / 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            match dispatcher.set_worker_threads(u64::from(resize_to)) {
                Ok(()) => tracing::info!(workers = resize_to, "resized worker pool mid-run"),
                Err(err) => tracing::error!(error = %err, "mid-run resize failed"),
            }
        })
    };

    let clients: Vec<_> = (0..args.connections)
        .map(|index| {
            tokio::spawn(run_client(
                Arc::clone(&dispatcher),
                index,
                args.searches,
                Arc::clone(&counters),
            ))
        })
        .collect();

    let mut latencies = Histogram::<u64>::new(3)?;
    for client in clients {
        let histogram = client.await??;
        latencies.add(&histogram)?;
    }
    resizer.abort();
    let elapsed = started.elapsed();

    let completed = counters.completed.load(Ordering::Relaxed);
    #[allow(clippy::cast_precision_loss)]
    let throughput = completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        connections = args.connections,
        completed,
        rejected = counters.rejected.load(Ordering::Relaxed),
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        ops_per_sec = %format!("{throughput:.0}"),
        workers = dispatcher.worker_count(),
        "run complete"
    );
    tracing::info!(
        p50_us = latencies.value_at_quantile(0.50),
        p90_us = latencies.value_at_quantile(0.90),
        p99_us = latencies.value_at_quantile(0.99),
        max_us = latencies.max(),
        "search latency"
    );

    let stopper = Arc::clone(&dispatcher);
    let drained = tokio::task::spawn_blocking(move || stopper.shutdown()).await?;
    if !drained {
        bail!("dispatcher did not drain before the timeout");
    }
    Ok(())
}
