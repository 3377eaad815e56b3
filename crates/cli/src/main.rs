use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use collaboration::{
    Actor, ActorId, ChannelNotifier, CollabEngine, EngineConfig, HistoryStep, InMemoryStore,
    ManualClock, Notification, Point, Shape, ShapeId, ShapePatch, ShapeSet, Size, Store,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canvas-sim")]
#[command(about = "Canvas collaboration simulator - Headless concurrency scenarios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drag one shape rapidly and count the store writes it causes
    Storm {
        /// Number of position updates
        #[arg(long, default_value = "60")]
        updates: u32,

        /// Delay between updates in milliseconds
        #[arg(long, default_value = "10")]
        interval_ms: u64,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Two users move the same shape at nearly the same time
    Conflict {
        /// Milliseconds between the two moves
        #[arg(long, default_value = "50")]
        gap_ms: i64,

        /// Delete the shape instead of moving it on the second client
        #[arg(long)]
        delete: bool,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Scripted edits followed by undo and redo
    History {
        /// Undo steps to take after the edits
        #[arg(long, default_value = "2")]
        undos: usize,

        /// Redo steps to take after undoing
        #[arg(long, default_value = "1")]
        redos: usize,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON report
    let default_filter = if cli.verbose {
        "canvas_sim=debug,collaboration=debug"
    } else {
        "canvas_sim=info,collaboration=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {:?}", path))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Storm {
            updates,
            interval_ms,
            output,
        } => storm_command(config, updates, interval_ms, output).await,
        Commands::Conflict {
            gap_ms,
            delete,
            output,
        } => conflict_command(config, gap_ms, delete, output).await,
        Commands::History {
            undos,
            redos,
            output,
        } => history_command(config, undos, redos, output).await,
    }
}

struct Client {
    engine: CollabEngine,
    notes: UnboundedReceiver<Notification>,
}

fn client(
    name: &str,
    store: &InMemoryStore,
    clock: &Arc<ManualClock>,
    config: EngineConfig,
) -> Result<Client> {
    let (notifier, notes) = ChannelNotifier::new();
    let engine = CollabEngine::builder(Actor::new(ActorId::new(), name), Arc::new(store.clone()))
        .config(config)
        .clock(clock.clone())
        .notifier(Arc::new(notifier))
        .build()?;
    engine.start();
    Ok(Client { engine, notes })
}

fn seed_shape() -> Shape {
    Shape::new(ShapeId::new(), Point::new(0.0, 0.0), Size::new(120.0, 80.0))
}

/// Wait until every client has nothing left to write.
async fn settle(clients: &[&CollabEngine], limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    while !clients.iter().all(|engine| engine.is_idle()) {
        if Instant::now() > deadline {
            bail!("clients still busy after {:?}", limit);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn drain(notes: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut drained = Vec::new();
    while let Ok(note) = notes.try_recv() {
        drained.push(note);
    }
    drained
}

/// Most writes seen inside any one-second window.
fn peak_per_second(writes: &[Instant]) -> usize {
    writes
        .iter()
        .enumerate()
        .map(|(i, start)| {
            writes[i..]
                .iter()
                .take_while(|at| at.duration_since(*start) < Duration::from_secs(1))
                .count()
        })
        .max()
        .unwrap_or(0)
}

fn emit(report: &serde_json::Value, output: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!("Report written to: {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn storm_command(
    config: EngineConfig,
    updates: u32,
    interval_ms: u64,
    output: Option<PathBuf>,
) -> Result<()> {
    info!("Running drag storm: {} updates every {}ms", updates, interval_ms);

    let shape = seed_shape();
    let store = InMemoryStore::with_shapes(vec![shape.clone()]);
    let clock = Arc::new(ManualClock::new(chrono::Utc::now().timestamp_millis()));

    // every accepted write fans out one snapshot
    let writes = Arc::new(Mutex::new(Vec::new()));
    let recorder = writes.clone();
    let started = Instant::now();
    let observer = store.subscribe(Arc::new(move |_: ShapeSet| recorder.lock().push(Instant::now())));
    writes.lock().clear();

    let x = client("Xavier", &store, &clock, config.clone())?;
    for step in 1..=updates {
        let to = Point::new(step as f64 * 5.0, step as f64 * 2.0);
        x.engine.move_shape(shape.id, to)?;
        clock.advance(interval_ms as i64);
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
    let issued_in = started.elapsed();
    settle(&[&x.engine], Duration::from_secs(30)).await?;
    drop(observer);

    let writes = writes.lock().clone();
    let stored = store.get(shape.id).context("storm shape vanished")?;
    if let Some(last) = x.engine.shape(shape.id) {
        if last.position != stored.position {
            warn!("local and stored positions differ after the storm");
        }
    }

    let report = serde_json::json!({
        "scenario": "storm",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updates": updates,
        "issued_in_ms": issued_in.as_millis() as u64,
        "writes": writes.len(),
        "peak_writes_per_second": peak_per_second(&writes),
        "max_updates_per_second": config.rate_limit.max_updates_per_second,
        "batching": config.rate_limit.batch,
        "final_position": stored.position,
        "failed_ops": x.engine.failed_ops(),
    });
    x.engine.shutdown().await;
    emit(&report, output)
}

async fn conflict_command(
    config: EngineConfig,
    gap_ms: i64,
    delete: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    info!("Running conflict scenario: second edit {}ms later", gap_ms);

    let shape = seed_shape();
    let store = InMemoryStore::with_shapes(vec![shape.clone()]);
    let clock = Arc::new(ManualClock::new(1000));

    // Xavier is on a slow link: that write is still batched when Yara's lands
    let mut slow = config.clone();
    slow.batch.batch_delay_ms = slow.batch.batch_delay_ms.max(1000);
    let mut x = client("Xavier", &store, &clock, slow)?;
    let mut y = client("Yara", &store, &clock, config)?;
    x.engine.register_actor(y.engine.actor().id, "Yara");
    y.engine.register_actor(x.engine.actor().id, "Xavier");

    x.engine.move_shape(shape.id, Point::new(100.0, 100.0))?;
    clock.advance(gap_ms);
    if delete {
        y.engine.delete_shape(shape.id)?;
    } else {
        y.engine.move_shape(shape.id, Point::new(200.0, 200.0))?;
    }
    settle(&[&x.engine, &y.engine], Duration::from_secs(30)).await?;

    let scenario = if delete {
        "delete_while_editing"
    } else {
        "simultaneous_move"
    };
    let report = serde_json::json!({
        "scenario": scenario,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "gap_ms": gap_ms,
        "xavier": {
            "conflicts": x.engine.recent_conflicts(),
            "notifications": drain(&mut x.notes),
            "failed_ops": x.engine.failed_ops(),
            "shape": x.engine.shape(shape.id),
        },
        "yara": {
            "conflicts": y.engine.recent_conflicts(),
            "notifications": drain(&mut y.notes),
            "failed_ops": y.engine.failed_ops(),
            "shape": y.engine.shape(shape.id),
        },
        "store": store.get(shape.id),
    });
    x.engine.shutdown().await;
    y.engine.shutdown().await;
    emit(&report, output)
}

async fn history_command(
    config: EngineConfig,
    undos: usize,
    redos: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    info!("Running history scenario: {} undos, {} redos", undos, redos);

    let store = InMemoryStore::new();
    let clock = Arc::new(ManualClock::new(1000));
    let x = client("Xavier", &store, &clock, config)?;
    let me = x.engine.actor().id;

    let shape = seed_shape();
    let mut edits = Vec::new();
    edits.push(x.engine.create_shape(shape.clone())?);
    clock.advance(100);
    edits.push(x.engine.move_shape(shape.id, Point::new(50.0, 40.0))?);
    clock.advance(100);
    edits.push(x.engine.resize_shape(shape.id, Size::new(200.0, 150.0))?);
    clock.advance(100);
    edits.push(x.engine.rotate_shape(shape.id, 30.0)?);
    clock.advance(100);
    edits.push(x.engine.update_shape(shape.id, ShapePatch::default().with_fill("#3366ff"))?);
    settle(&[&x.engine], Duration::from_secs(10)).await?;

    let mut steps = Vec::new();
    let plan = std::iter::repeat("undo")
        .take(undos)
        .chain(std::iter::repeat("redo").take(redos));
    for action in plan {
        clock.advance(100);
        let description = match action {
            "undo" => x.engine.undo_description(),
            _ => x.engine.redo_description(),
        };
        let step = match action {
            "undo" => x.engine.undo(me)?,
            _ => x.engine.redo(me)?,
        };
        let outcome = match step {
            HistoryStep::Ready(_) => serde_json::json!("applied"),
            HistoryStep::Empty => serde_json::json!("empty"),
            HistoryStep::Refused(reason) => serde_json::json!({ "refused": reason }),
        };
        steps.push(serde_json::json!({
            "action": action,
            "description": description,
            "outcome": outcome,
        }));
    }
    settle(&[&x.engine], Duration::from_secs(10)).await?;

    let report = serde_json::json!({
        "scenario": "history",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "edits": edits,
        "steps": steps,
        "can_undo": x.engine.can_undo(),
        "can_redo": x.engine.can_redo(),
        "shape": x.engine.shape(shape.id),
        "store": store.get(shape.id),
    });
    x.engine.shutdown().await;
    emit(&report, output)
}
