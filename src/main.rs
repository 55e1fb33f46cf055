//! Command-line entry point for the SMS campaign engine.
//!
//! This binary is glue: it opens the database, wires the repositories and
//! background workers together, and exposes a handful of subcommands for
//! running a campaign from a recipient list and inspecting queue state. It
//! is not part of the engine's core contract — a host application embeds
//! [`sms_engine`] directly rather than shelling out to this CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sms_engine::circuit_breaker::CircuitBreaker;
use sms_engine::config::EngineConfig;
use sms_engine::database::{DatabaseConfig, DatabasePath, StorageEngine};
use sms_engine::domain_types::CampaignId;
use sms_engine::entitlement::EntitlementManager;
use sms_engine::events::EventBus;
use sms_engine::retry_worker::spawn_retry_worker;
use sms_engine::send_pipeline::spawn_campaign;
use sms_engine::storage::{
    SqliteAuditLogRepository, SqliteMessagingRepository, SqliteOutboundQueueRepository, SqliteSendLogRepository,
};
use sms_engine::template::Recipient;
use sms_engine::time_provider::{production_time_provider, TimeProvider};
use sms_engine::transport::{FileDeviceBinding, FileKeystore, IncomingSms, SendOutcome, SmsTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sms-engine", about = "Device-resident bulk SMS campaign engine")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, default_value = "sms-engine.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sends a campaign to every recipient in a CSV file.
    Send {
        /// CSV file with a `phone` column and optional `name`/`amount` columns.
        recipients: PathBuf,
        /// Message body template, e.g. "Hi {{name}}, balance {{amount}}".
        template: String,
        /// SIM slot to dispatch from.
        #[arg(long, default_value_t = 1)]
        sim_slot: u8,
    },
    /// Prints aggregate outbound queue counts.
    QueueStats,
    /// Runs one retry-worker drain cycle against the current queue, then exits.
    Retry,
}

/// A transport that prints to stdout, for CLI use outside of tests.
struct ConsoleTransport;

#[async_trait::async_trait]
impl SmsTransport for ConsoleTransport {
    async fn send(&self, to: &str, body: &str, sim_slot: u8) -> SendOutcome {
        println!("[sim {sim_slot}] -> {to}: {body}");
        SendOutcome::success()
    }

    async fn can_send(&self) -> bool {
        true
    }

    async fn poll_incoming(&self) -> Vec<IncomingSms> {
        Vec::new()
    }
}

/// Builds the production entitlement manager, backing the signing key and
/// device fingerprint with JSON files alongside the database rather than a
/// platform keystore this CLI has no access to.
fn build_entitlement_manager(
    db_path: &std::path::Path,
    time_provider: Arc<dyn TimeProvider>,
    config: &EngineConfig,
    audit_log: Arc<SqliteAuditLogRepository>,
) -> EntitlementManager {
    let base_dir = db_path.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
    let keystore = Arc::new(FileKeystore::open(base_dir.join("entitlement_keystore.json")));
    let device_binding = Arc::new(FileDeviceBinding::open(base_dir.join("device_id"), keystore.clone()));
    EntitlementManager::new(
        keystore,
        device_binding,
        time_provider,
        config.grace_period,
        config.trial_duration,
        config.renewal_reminder_days,
    )
    .with_audit_log(audit_log)
}

/// Splits a CSV line on commas, honoring simple double-quoted fields. No
/// escaped-quote support, matching the hand-rolled scope this CLI needs.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            other => current.push(other),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Parses a recipient CSV file. The header row names the columns; `phone`
/// is required, `name` and `amount` are recognized specially, every other
/// column becomes a template field.
fn parse_recipients_csv(path: &std::path::Path) -> Result<Vec<Recipient>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading recipient file {}", path.display()))?;
    let mut lines = content.lines();
    let header = lines.next().context("recipient file is empty")?;
    let columns = split_csv_line(header);
    let phone_idx = columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case("phone"))
        .context("recipient file must have a 'phone' column")?;
    let name_idx = columns.iter().position(|c| c.eq_ignore_ascii_case("name"));
    let amount_idx = columns.iter().position(|c| c.eq_ignore_ascii_case("amount"));

    let mut recipients = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_csv_line(line);
        let Some(phone) = cells.get(phone_idx) else {
            continue;
        };
        let mut recipient = Recipient::new(phone.clone());
        if let Some(idx) = name_idx {
            if let Some(name) = cells.get(idx).filter(|n| !n.is_empty()) {
                recipient = recipient.with_name(name.clone());
            }
        }
        if let Some(idx) = amount_idx {
            if let Some(amount) = cells.get(idx).and_then(|a| a.parse::<i64>().ok()) {
                recipient = recipient.with_amount(amount);
            }
        }
        for (i, column) in columns.iter().enumerate() {
            if i == phone_idx || Some(i) == name_idx || Some(i) == amount_idx {
                continue;
            }
            if let Some(value) = cells.get(i) {
                recipient = recipient.with_field(column.clone(), value.clone());
            }
        }
        recipients.push(recipient);
    }
    Ok(recipients)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sms_engine=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(EngineConfig::default());
    config.validate().context("invalid engine configuration")?;

    let time_provider: Arc<dyn TimeProvider> = production_time_provider();
    let db_path = DatabasePath::new(&cli.db).context("invalid database path")?;
    let db_config = DatabaseConfig::new(db_path, &config);
    let engine = StorageEngine::open(db_config, time_provider.as_ref())
        .await
        .context("opening database")?;
    let queue = engine.queue().clone();

    let messaging = Arc::new(SqliteMessagingRepository::new(queue.clone(), time_provider.clone()));
    let outbound_queue = Arc::new(SqliteOutboundQueueRepository::new(queue.clone(), time_provider.clone()));
    let send_log = Arc::new(SqliteSendLogRepository::new(queue.clone(), time_provider.clone()));
    let audit_log = Arc::new(SqliteAuditLogRepository::new(queue, time_provider.clone()));
    let events = EventBus::new();

    match cli.command {
        Command::Send { recipients, template, sim_slot } => {
            let recipients = parse_recipients_csv(&recipients)?;
            let total = recipients.len() as u64;
            info!(total, "starting campaign");

            let transport: Arc<dyn SmsTransport> = Arc::new(ConsoleTransport);
            let entitlement = Arc::new(build_entitlement_manager(&cli.db, time_provider.clone(), &config, audit_log));
            let campaign_id = CampaignId::generate();
            let handle = spawn_campaign(
                campaign_id,
                recipients,
                template,
                sim_slot,
                messaging,
                outbound_queue,
                send_log,
                transport,
                entitlement,
                config,
                events,
            );
            let counters = handle.join().await.context("campaign task panicked")?;
            println!(
                "sent={} failed={} skipped={} invalid={} denied={}",
                counters.sent, counters.failed, counters.skipped, counters.invalid, counters.denied
            );
        }
        Command::QueueStats => {
            use sms_engine::storage::OutboundQueueRepository;
            let stats = outbound_queue.get_stats().await.context("fetching queue stats")?;
            println!(
                "pending={} sent={} failed={} exhausted={}",
                stats.pending, stats.sent, stats.failed, stats.exhausted
            );
        }
        Command::Retry => {
            let transport: Arc<dyn SmsTransport> = Arc::new(ConsoleTransport);
            let circuit_breaker = Arc::new(CircuitBreaker::new(
                config.circuit_breaker_window,
                config.circuit_breaker_min_samples,
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown,
                time_provider.clone(),
            ));
            let handle = spawn_retry_worker(outbound_queue, messaging, transport, config, circuit_breaker, events);
            handle.notify_failure();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            handle.stop();
            handle.join().await.context("retry worker task panicked")?;
            info!("retry drain cycle complete");
        }
    }

    if !engine.database_file_exists() {
        warn!("database file missing after operation; results may not have persisted");
    }

    Ok(())
}
