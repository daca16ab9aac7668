use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rcs_probe::config::{self, Config};
use rcs_probe::identity::{self, IdentityMap, IdentityRegistry};
use rcs_probe::message::EventType;
use rcs_probe::observer::DeliveryObserver;
use rcs_probe::sender::{MessageSender, SendResult};
use rcs_probe::sequence::{self, Sequencer};
use rcs_probe::store::FirestoreLog;
use rcs_probe::webhook::{WebhookResult, WebhookSimulator};

/// How long `sequence --listen` waits for the watch baseline before sending.
const BASELINE_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "rcs-probe")]
#[command(about = "Send test messages to the scheduler backend and watch the delivery log", long_about = None)]
struct Cli {
    /// Config file path (default: RCS_PROBE_CONFIG_PATH or ~/.rcs-probe/config.json)
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a template config.json.
    Init,

    /// Send one message as a participant.
    Send {
        /// Participant id to send as.
        #[arg(long, short)]
        user: String,

        /// Message text.
        #[arg(long, short)]
        message: String,

        /// eventTypeCode (1 = text, 2 = quick reply).
        #[arg(long, default_value_t = 1)]
        event_type: u8,

        /// After sending, wait 3 seconds and show the newest log records.
        #[arg(long)]
        check: bool,
    },

    /// Run a message sequence for one user. Failed steps are reported and the run continues.
    Sequence {
        /// Participant id (omit with --new-user).
        #[arg(long, short, required_unless_present = "new_user")]
        user: Option<String>,

        /// Generate a fresh TEST_ user id and run the enrollment flow for it.
        #[arg(long)]
        new_user: bool,

        /// External id to register for this run (lets a new user be observed).
        #[arg(long, value_name = "ID")]
        external: Option<String>,

        /// Seconds between steps; overrides each step's own delay.
        #[arg(long, short)]
        delay: Option<u64>,

        /// Run the short smoke conversation instead of enrollment.
        #[arg(long)]
        smoke: bool,

        /// Log records to read after each step (0 disables checking).
        #[arg(long, default_value_t = 5)]
        check_limit: u32,

        /// Watch the log during the run and report how many records arrived.
        #[arg(long)]
        listen: bool,

        /// Seconds to keep listening after the last step.
        #[arg(long, default_value_t = 10)]
        settle: u64,
    },

    /// Show the newest delivery-log records for a participant.
    Check {
        #[arg(long, short)]
        user: String,

        #[arg(long, short, default_value_t = 5)]
        limit: u32,
    },

    /// Print new delivery-log records as they appear, until Ctrl+C or --duration elapses.
    Watch {
        #[arg(long, short)]
        user: String,

        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Send N numbered messages and report latency.
    Load {
        #[arg(long, short)]
        user: String,

        #[arg(long, short = 'n', default_value_t = 10)]
        count: usize,

        /// Seconds between messages.
        #[arg(long, short, default_value_t = 1)]
        delay: u64,
    },

    /// Post a simulated carrier webhook.
    Webhook {
        #[command(subcommand)]
        target: WebhookTarget,
    },
}

#[derive(Subcommand)]
enum WebhookTarget {
    /// Messenger platform page event to /facebook.
    Facebook {
        #[arg(long)]
        sender: String,
        #[arg(long, short)]
        message: String,
    },
    /// SMS callback to /twilio.
    Twilio {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, short)]
        message: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config_path = cli.config;

    let outcome = match cli.command {
        Some(Commands::Version) => {
            println!("rcs-probe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init) => run_init(config_path),
        Some(Commands::Send {
            user,
            message,
            event_type,
            check,
        }) => run_send(config_path, user, message, event_type, check).await,
        Some(Commands::Sequence {
            user,
            new_user,
            external,
            delay,
            smoke,
            check_limit,
            listen,
            settle,
        }) => {
            let opts = SequenceOpts {
                user,
                new_user,
                external,
                delay,
                smoke,
                check_limit,
                listen,
                settle,
            };
            run_sequence(config_path, opts).await
        }
        Some(Commands::Check { user, limit }) => run_check(config_path, user, limit).await,
        Some(Commands::Watch { user, duration }) => run_watch(config_path, user, duration).await,
        Some(Commands::Load { user, count, delay }) => run_load(config_path, user, count, delay).await,
        Some(Commands::Webhook { target }) => run_webhook(config_path, target).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = rcs_probe::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    println!("edit {} to set backend.baseUrl, device.fcmToken, store and participants", path.display());
    Ok(())
}

fn load(config_path: Option<PathBuf>) -> anyhow::Result<(Config, IdentityRegistry)> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let map = IdentityMap::new(config.participants.clone());
    Ok((config, IdentityRegistry::new(Arc::new(map))))
}

fn print_known_participants(identities: &IdentityRegistry) {
    let known = identities.entries();
    if known.is_empty() {
        println!("No participants configured; add them under \"participants\" in the config");
        return;
    }
    println!("Known participants:");
    for (participant, external) in known {
        println!("   {} -> {}", participant, external);
    }
}

fn build_sender(config: &Config) -> anyhow::Result<MessageSender> {
    let base_url = config::require_base_url(config)?;
    let token = config::resolve_device_token(config);
    if token.is_empty() {
        log::warn!("device token not configured; sending empty fcmToken");
    }
    Ok(MessageSender::new(
        &base_url,
        token,
        config.backend.timeout(),
        &config.backend.user_agent,
    )?)
}

/// Observer over the configured store. Store setup problems are reported and observation is
/// skipped; they never stop sends.
fn build_observer(config: &Config) -> Option<DeliveryObserver> {
    match FirestoreLog::from_config(config) {
        Ok(log) => Some(DeliveryObserver::from_config(Arc::new(log), &config.store)),
        Err(e) => {
            log::warn!("delivery log unavailable: {}", e);
            println!("Delivery log unavailable: {}", e);
            None
        }
    }
}

fn print_send(text: &str, result: &SendResult) {
    println!("Sending: {}", text);
    println!("   ID: {}", result.message_id);
    match (result.ok, result.http_status) {
        (true, _) => println!("   Success ({:.0}ms)", result.elapsed_ms),
        (false, Some(status)) => println!("   Failed! Status: {} ({:.0}ms)", status, result.elapsed_ms),
        (false, None) => println!(
            "   Error: {}",
            result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no response".to_string())
        ),
    }
    if let Some(body) = &result.body {
        let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
        println!("   Response: {}", pretty);
    } else if let Some(text) = &result.text {
        println!("   Response (text): {}", text.trim());
    } else if result.ok {
        println!("   Empty response from server");
    }
}

async fn print_records(observer: &DeliveryObserver, external_id: &str, limit: u32) {
    println!("Checking delivery log for {}", external_id);
    let records = observer.check_messages(external_id, limit).await;
    if records.is_empty() {
        println!("   No messages found");
    }
    for r in &records {
        println!("   {}", r);
    }
}

async fn run_send(
    config_path: Option<PathBuf>,
    user: String,
    message: String,
    event_type: u8,
    check: bool,
) -> anyhow::Result<()> {
    let (config, identities) = load(config_path)?;
    let sender = build_sender(&config)?;
    let result = sender.send(&user, &message, EventType::from_code(event_type)).await;
    print_send(&message, &result);

    if check {
        if let Some(ext) = identities.resolve(&user) {
            if let Some(observer) = build_observer(&config) {
                tokio::time::sleep(Duration::from_secs(3)).await;
                print_records(&observer, &ext, 3).await;
            }
        }
    }
    Ok(())
}

struct SequenceOpts {
    user: Option<String>,
    new_user: bool,
    external: Option<String>,
    delay: Option<u64>,
    smoke: bool,
    check_limit: u32,
    listen: bool,
    settle: u64,
}

async fn run_sequence(config_path: Option<PathBuf>, opts: SequenceOpts) -> anyhow::Result<()> {
    let (config, mut identities) = load(config_path)?;
    let sender = build_sender(&config)?;

    let user = match (opts.new_user, opts.user) {
        (true, _) | (false, None) => {
            let id = identity::generate_test_user_id();
            println!("Generated user id: {}", id);
            id
        }
        (false, Some(u)) => u,
    };
    if let Some(ext) = opts.external {
        identities.register(user.clone(), ext);
    }

    let mut steps = if opts.smoke {
        sequence::smoke_steps()
    } else {
        sequence::default_enrollment()
    };
    if let Some(secs) = opts.delay {
        steps = sequence::with_uniform_delay(steps, Duration::from_secs(secs));
    }

    let external_id = identities.resolve(&user);
    let observer = match &external_id {
        Some(_) if opts.check_limit > 0 || opts.listen => build_observer(&config),
        _ => None,
    };

    println!("=== Starting sequence ===");
    println!("Participant ID: {}", user);
    println!("External ID: {}", external_id.as_deref().unwrap_or("(unmapped)"));

    let received = Arc::new(AtomicUsize::new(0));
    let watch = match (&observer, &external_id, opts.listen) {
        (Some(observer), Some(ext), true) => {
            let received = received.clone();
            Some(observer.watch(ext, move |r| {
                received.fetch_add(1, Ordering::SeqCst);
                println!("New message received: {}", r);
            }))
        }
        _ => None,
    };
    if let Some(watch) = &watch {
        match tokio::time::timeout(BASELINE_WAIT, watch.ready()).await {
            Ok(true) => log::debug!("watch baseline established"),
            Ok(false) => log::warn!("watch stopped before its baseline poll; replies will not be listed"),
            Err(_) => log::warn!(
                "no watch baseline after {}s; replies logged before it will not be listed",
                BASELINE_WAIT.as_secs()
            ),
        }
    }

    let mut sequencer = Sequencer::new(&sender).with_check_limit(opts.check_limit);
    if opts.check_limit > 0 {
        if let Some(observer) = &observer {
            sequencer = sequencer.with_observer(observer);
        }
    }

    let total = steps.len();
    let report = sequencer
        .run_with_progress(&user, external_id.as_deref(), &steps, |i, outcome| {
            println!();
            println!("Step {}/{}", i + 1, total);
            print_send(&outcome.text, &outcome.result);
            if let Some(n) = outcome.replies {
                println!("   Log records since send: {}", n);
            }
            if i + 1 < total && !steps[i].delay.is_zero() {
                println!("Waiting {} seconds before next message...", steps[i].delay.as_secs());
            }
        })
        .await;

    if let Some(watch) = watch {
        println!("Waiting {} seconds for replies...", opts.settle);
        tokio::time::sleep(Duration::from_secs(opts.settle)).await;
        watch.stop();
    }

    println!();
    println!("=== Sequence summary ===");
    println!("{}", report);
    println!("Failed: {}", report.failed());
    if opts.listen && external_id.is_some() {
        println!("Log messages received: {}", received.load(Ordering::SeqCst));
    }
    Ok(())
}

async fn run_check(config_path: Option<PathBuf>, user: String, limit: u32) -> anyhow::Result<()> {
    let (config, identities) = load(config_path)?;
    let Some(ext) = identities.resolve(&user) else {
        println!("Unknown user id {}: no external id mapped, nothing to check", user);
        print_known_participants(&identities);
        return Ok(());
    };
    if let Some(observer) = build_observer(&config) {
        print_records(&observer, &ext, limit).await;
    }
    Ok(())
}

async fn run_watch(config_path: Option<PathBuf>, user: String, duration: Option<u64>) -> anyhow::Result<()> {
    let (config, identities) = load(config_path)?;
    let Some(ext) = identities.resolve(&user) else {
        println!("Unknown user id {}: no external id mapped, nothing to watch", user);
        print_known_participants(&identities);
        return Ok(());
    };
    let Some(observer) = build_observer(&config) else {
        return Ok(());
    };

    println!("Watching delivery log for {} (Ctrl+C to stop)", ext);
    let handle = observer.watch(&ext, |r| {
        println!("New message received: {}", r);
    });

    match duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("waiting for Ctrl+C failed: {}", e);
            }
        }
    }

    handle.stop();
    println!("Watch stopped");
    Ok(())
}

async fn run_load(config_path: Option<PathBuf>, user: String, count: usize, delay: u64) -> anyhow::Result<()> {
    let (config, _) = load(config_path)?;
    let sender = build_sender(&config)?;
    println!("=== Load test ===");
    println!("Sending {} messages with {}s delay", count, delay);
    let report = sequence::load_test(&sender, &user, count, Duration::from_secs(delay)).await;
    println!("{}", report);
    Ok(())
}

fn print_webhook(result: &WebhookResult) {
    println!("POST {}", result.endpoint);
    match result.status {
        Some(status) => println!(
            "   {} Status: {} ({:.0}ms)",
            if result.ok { "Success." } else { "Failed!" },
            status,
            result.elapsed_ms
        ),
        None => println!("   Error: {}", result.error.as_deref().unwrap_or("no response")),
    }
    if !result.body.trim().is_empty() {
        println!("   Response: {}", result.body.trim());
    }
}

async fn run_webhook(config_path: Option<PathBuf>, target: WebhookTarget) -> anyhow::Result<()> {
    let (config, _) = load(config_path)?;
    let base_url = config::require_base_url(&config)?;
    let simulator = WebhookSimulator::new(
        &base_url,
        &config.webhooks,
        config.backend.timeout(),
        &config.backend.user_agent,
    )?;
    let result = match target {
        WebhookTarget::Facebook { sender, message } => simulator.simulate_facebook(&sender, &message).await,
        WebhookTarget::Twilio { from, to, message } => simulator.simulate_twilio(&from, &to, &message).await,
    };
    print_webhook(&result);
    Ok(())
}
