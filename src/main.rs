//! FlowRunner CLI Entry Point
//!
//! Runs the workflow engine against an in-memory store with a small demo
//! workflow registered.
//!
//! # Usage
//!
//! ```bash
//! # Run with default settings
//! flowrunner
//!
//! # Load settings from a file
//! flowrunner engine.yaml
//!
//! # Seed demo instances
//! flowrunner --demo 20
//!
//! # Override the worker pool size
//! flowrunner engine.yaml --pool-size 8
//! ```
//!
//! Ctrl-C stops the dispatcher and waits for running executors. A second
//! Ctrl-C stops waiting.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration, Utc};
use colored::Colorize;
use log::{error, info, warn};
use tokio::runtime::Runtime;

use flowrunner::config::EngineConfig;
use flowrunner::error::BoxError;
use flowrunner::execution::{CancellationToken, Engine, ShutdownStatus};
use flowrunner::store::InMemoryStore;
use flowrunner::workflow::{
    QueryWorkflowInstances, State, WorkflowDefinition, WorkflowInstance, WorkflowInstanceStatus,
    WorkflowRegistry,
};
use flowrunner::{APP_NAME, VERSION};

/// Workflow type of the demo parent workflow.
const DEMO_ORDER: &str = "demo-order";

/// Workflow type of the demo child workflow.
const DEMO_SHIPMENT: &str = "demo-shipment";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    config_path: Option<String>,
    pool_size: Option<usize>,
    demo_instances: usize,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold().cyan(), VERSION);
    println!("{}", "Persistent Workflow Execution Engine".dimmed());
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] [CONFIG_FILE]");
    println!();
    println!("Arguments:");
    println!("  [CONFIG_FILE]       Optional engine configuration in YAML");
    println!();
    println!("Options:");
    println!("  --pool-size N       Number of worker threads");
    println!("  --demo N            Insert N demo workflow instances at startup");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Environment:");
    println!("  FLOWRUNNER_POOL_SIZE, FLOWRUNNER_BATCH_SIZE,");
    println!("  FLOWRUNNER_SLEEP_MS, FLOWRUNNER_SHUTDOWN_TIMEOUT_MS");
    println!();
    println!("Examples:");
    println!("  flowrunner --demo 10");
    println!("  flowrunner engine.yaml --pool-size 8");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--pool-size" => {
                i += 1;
                if i >= args.len() {
                    return Err("--pool-size requires a number argument".to_string());
                }
                config.pool_size = Some(
                    args[i]
                        .parse()
                        .map_err(|_| format!("Invalid pool size: {}", args[i]))?,
                );
            }
            "--demo" => {
                i += 1;
                if i >= args.len() {
                    return Err("--demo requires a number argument".to_string());
                }
                config.demo_instances = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid demo count: {}", args[i]))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.config_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.config_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Loads the engine configuration and applies environment and CLI overrides.
fn load_engine_config(config: &Config) -> Result<EngineConfig, BoxError> {
    let mut engine_config = match config.config_path {
        Some(ref path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    engine_config.apply_env()?;

    if let Some(pool_size) = config.pool_size {
        engine_config.dispatcher.pool_size = pool_size;
        engine_config.validate()?;
    }

    Ok(engine_config)
}

/// Registers the demo order workflow and its shipment child workflow.
fn demo_registry() -> Result<WorkflowRegistry, BoxError> {
    let mut registry = WorkflowRegistry::new();

    registry.register(
        WorkflowDefinition::new(DEMO_ORDER, "validate", "rejected")
            .state(
                State::start("validate")
                    .describe("Check the order amount")
                    .handler(|ctx| {
                        let amount: u32 = ctx.get_typed_variable("amount")?.unwrap_or(0);
                        if amount == 0 {
                            ctx.set_next_state_reason("Order has no amount");
                            ctx.set_next_state("rejected")?;
                        } else {
                            ctx.set_next_state("ship")?;
                        }
                        Ok(())
                    }),
            )
            .state(
                State::normal("ship")
                    .describe("Start a shipment and wait for it")
                    .handler(|ctx| {
                        let shipment = WorkflowInstance::builder(DEMO_SHIPMENT)
                            .business_key(ctx.business_key().unwrap_or_default())
                            .build();
                        ctx.add_child_workflows(vec![shipment])?;
                        ctx.set_next_state("await_shipment")?;
                        // The shipment wakes this instance up when it is done
                        ctx.set_next_activation(Some(Utc::now() + Duration::hours(1)));
                        Ok(())
                    }),
            )
            .state(
                State::normal("await_shipment")
                    .describe("Complete once every shipment is delivered")
                    .handler(|ctx| {
                        let shipments = ctx.query_child_workflows(&QueryWorkflowInstances::default())?;
                        let delivered = shipments
                            .iter()
                            .all(|s| s.status == WorkflowInstanceStatus::Finished);
                        if delivered {
                            ctx.set_next_state("done")?;
                        } else {
                            ctx.set_retry(true);
                        }
                        Ok(())
                    }),
            )
            .state(State::end("done"))
            .state(State::end("rejected")),
    )?;

    registry.register(
        WorkflowDefinition::new(DEMO_SHIPMENT, "pack", "lost")
            .state(State::start("pack").handler(|ctx| {
                ctx.set_next_state("deliver")?;
                Ok(())
            }))
            .state(State::normal("deliver").handler(|ctx| {
                ctx.wake_up_parent_workflow();
                ctx.set_next_state("delivered")?;
                Ok(())
            }))
            .state(State::end("delivered"))
            .state(State::end("lost")),
    )?;

    Ok(registry)
}

/// Inserts demo orders with varying amounts.
fn seed_demo_instances(engine: &Engine, count: usize) -> Result<(), BoxError> {
    for n in 1..=count {
        // Every fifth order has no amount and is rejected
        let amount = if n % 5 == 0 { 0 } else { n * 10 };
        let order = WorkflowInstance::builder(DEMO_ORDER)
            .business_key(format!("order-{}", n))
            .variable("amount", amount.to_string())
            .build();
        engine.insert_workflow(order)?;
    }

    info!("Inserted {} demo orders", count);
    Ok(())
}

/// Prints how many instances ended up in each status.
fn print_summary(engine: &Engine) -> Result<(), BoxError> {
    let instances = engine.query_workflows(&QueryWorkflowInstances::default())?;
    if instances.is_empty() {
        return Ok(());
    }

    let count = |status: WorkflowInstanceStatus| {
        instances.iter().filter(|i| i.status == status).count()
    };

    println!();
    println!("{}", "Workflow instances".bold());
    println!("  total:       {}", instances.len());
    println!("  finished:    {}", count(WorkflowInstanceStatus::Finished).to_string().green());
    println!("  in progress: {}", count(WorkflowInstanceStatus::InProgress).to_string().yellow());
    println!("  manual:      {}", count(WorkflowInstanceStatus::Manual).to_string().red());
    Ok(())
}

/// Blocks until Ctrl-C, then shuts the engine down. A second Ctrl-C
/// abandons waiting for running executors.
fn wait_and_shutdown(runtime: &Runtime, mut engine: Engine) -> Result<Engine, BoxError> {
    runtime.block_on(tokio::signal::ctrl_c())?;
    println!();
    info!("Interrupt received, shutting down (press Ctrl-C again to stop waiting)");

    let token = CancellationToken::new();
    let canceller = token.clone();

    let (status, engine) = runtime.block_on(async move {
        let mut shutdown = tokio::task::spawn_blocking(move || {
            let status = engine.shutdown_interruptibly(&token);
            (status, engine)
        });

        tokio::select! {
            result = &mut shutdown => result,
            _ = tokio::signal::ctrl_c() => {
                canceller.cancel();
                shutdown.await
            }
        }
    })?;

    match status {
        ShutdownStatus::Completed => info!("Shutdown complete"),
        ShutdownStatus::Interrupted => warn!("Shutdown interrupted, executors may still be running"),
    }
    Ok(engine)
}

/// Main application entry point.
fn run() -> Result<(), BoxError> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let engine_config = load_engine_config(&config).map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    info!(
        "Worker pool: {} threads, poll batch: {}",
        engine_config.dispatcher.pool_size, engine_config.dispatcher.poll_batch_size
    );

    let store = Arc::new(InMemoryStore::with_config(&engine_config.store));
    let registry = Arc::new(demo_registry()?);
    info!("Registered workflows: {:?}", registry.workflow_types());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let mut engine = Engine::new(engine_config, store, registry)?;
    engine.start()?;

    if config.demo_instances > 0 {
        seed_demo_instances(&engine, config.demo_instances)?;
    }

    info!("Engine running, press Ctrl-C to stop");
    let engine = wait_and_shutdown(&runtime, engine)?;
    print_summary(&engine)?;

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
