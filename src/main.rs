//! # beacon
//!
//! Command-line watcher for feedback-service broadcasts. Subscribes to
//! topics over the configured transport and prints each delivered message
//! as one JSON line on stdout. Diagnostics go to stderr.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use beacon_core::{
    ChangeKind, EntityTopics, Envelope, EnvelopeDecoder, Feedback, Message, Scheme, Topic,
    TopicError,
};
use beacon_live::{
    ConnectionSupervisor, LiveBinding, LiveContext, LiveError, PullDelivery, nats_options,
};
use beacon_settings::{BeaconSettings, BroadcastSettings};
use beacon_transport::{NatsTransport, Transport};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

/// Watch live broadcasts from the feedback service.
#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Watch live broadcasts from the feedback service")]
struct Cli {
    /// Broadcast endpoint (overrides settings).
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Settings file (overrides `$BEACON_SETTINGS`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to topics and print every message as a JSON line.
    Watch {
        /// Topics to subscribe to (`*` and `>` wildcards allowed).
        topics: Vec<String>,

        /// Decode payloads as feedback records; defaults the topic to `feedback.*`.
        #[arg(long)]
        feedback: bool,

        /// Buffer messages and print them in batches instead of per message.
        #[arg(long)]
        pull: bool,

        #[command(flatten)]
        scope: Scope,
    },
    /// Connect once, report readiness, and close.
    Check,
    /// Print the broadcast subjects for an entity.
    Topics {
        /// Entity name, e.g. `feedback`.
        entity: String,

        /// Narrow the subjects to one record.
        #[arg(long, conflicts_with_all = ["branch", "organization"])]
        id: Option<String>,

        #[command(flatten)]
        scope: Scope,
    },
}

/// Narrows entity subjects to one branch or one organization.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
#[group(multiple = false)]
struct Scope {
    /// Only changes published for this branch.
    #[arg(long)]
    branch: Option<String>,

    /// Only changes published for this organization.
    #[arg(long)]
    organization: Option<String>,
}

impl Scope {
    fn is_set(&self) -> bool {
        self.branch.is_some() || self.organization.is_some()
    }

    /// Subject carrying every change of `kind` in the scope.
    fn changes(&self, topics: &EntityTopics, kind: ChangeKind) -> Result<Topic, TopicError> {
        match (&self.branch, &self.organization) {
            (Some(branch), _) => topics.changes_for_branch(kind, branch),
            (None, Some(organization)) => topics.changes_for_organization(kind, organization),
            (None, None) => Ok(topics.changes(kind)),
        }
    }

    /// Pattern that sees each change in the scope exactly once.
    fn actions(&self, topics: &EntityTopics) -> Result<Topic, TopicError> {
        match (&self.branch, &self.organization) {
            (Some(branch), _) => topics.branch_actions(branch),
            (None, Some(organization)) => topics.organization_actions(organization),
            (None, None) => Ok(topics.actions()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    beacon_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    match cli.command {
        Command::Watch {
            topics,
            feedback,
            pull,
            scope,
        } => {
            let topics = resolve_topics(&topics, feedback, &scope)?;
            let transport = transport_for(&settings.broadcast)?;
            let ctx = LiveContext::from_settings(&settings.broadcast, transport)?;
            let capacity = settings.broadcast.pull_buffer_capacity;
            if feedback {
                watch::<Feedback>(ctx, topics, pull, capacity).await
            } else {
                watch::<serde_json::Value>(ctx, topics, pull, capacity).await
            }
        }
        Command::Check => check(&settings.broadcast).await,
        Command::Topics { entity, id, scope } => {
            for topic in entity_topics(&entity, id.as_deref(), &scope)? {
                println!("{topic}");
            }
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Setup
// ─────────────────────────────────────────────────────────────────────────────

fn load_settings(cli: &Cli) -> Result<BeaconSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(beacon_settings::settings_path);
    let mut settings = beacon_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(endpoint) = &cli.endpoint {
        settings.broadcast.endpoint.clone_from(endpoint);
        settings.validate().context("Invalid --endpoint")?;
    }
    Ok(settings)
}

fn transport_for(settings: &BroadcastSettings) -> Result<Arc<dyn Transport>> {
    let endpoint = settings.endpoint()?;
    match endpoint.scheme() {
        Scheme::Memory => bail!("{endpoint} is an in-process endpoint; use ws:// or wss://"),
        Scheme::Ws | Scheme::Wss => Ok(Arc::new(NatsTransport::new(nats_options(settings)))),
    }
}

/// Explicit topics win; `--feedback` alone subscribes to one pattern that
/// sees each feedback change once.
fn resolve_topics(raw: &[String], feedback: bool, scope: &Scope) -> Result<Vec<Topic>> {
    if !raw.is_empty() {
        if scope.is_set() {
            bail!("--branch/--organization narrow the default feedback topic and cannot be combined with explicit topics");
        }
        return raw
            .iter()
            .map(|t| Topic::new(t.as_str()).with_context(|| format!("Invalid topic `{t}`")))
            .collect();
    }
    if !feedback {
        bail!("watch needs at least one topic");
    }
    let topic = scope
        .actions(&EntityTopics::feedback())
        .context("Invalid scope")?;
    Ok(vec![topic])
}

fn entity_topics(entity: &str, id: Option<&str>, scope: &Scope) -> Result<Vec<Topic>> {
    let topics = EntityTopics::new(entity)?;
    let mut out = Vec::with_capacity(ChangeKind::ALL.len() + 1);
    for kind in ChangeKind::ALL {
        out.push(match id {
            Some(id) => topics.changes_for(kind, id)?,
            None => scope.changes(&topics, kind)?,
        });
    }
    if id.is_none() {
        out.push(scope.actions(&topics)?);
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

async fn check(settings: &BroadcastSettings) -> Result<()> {
    let endpoint = settings.endpoint()?;
    let supervisor = ConnectionSupervisor::new(endpoint.clone(), transport_for(settings)?);
    let conn = supervisor
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;
    println!(
        "{}",
        serde_json::json!({
            "endpoint": endpoint.as_str(),
            "connection": conn.id().as_str(),
            "state": supervisor.state().to_string(),
        })
    );
    supervisor.close().await?;
    Ok(())
}

async fn watch<T>(ctx: LiveContext, topics: Vec<Topic>, pull: bool, capacity: Option<usize>) -> Result<()>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    info!(endpoint = %ctx.endpoint(), topics = topics.len(), pull, "watching");
    if pull {
        watch_pull::<T>(ctx, topics, capacity).await
    } else {
        watch_push::<T>(ctx, topics).await
    }
}

async fn watch_push<T>(ctx: LiveContext, topics: Vec<Topic>) -> Result<()>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    let mut bindings = Vec::with_capacity(topics.len());
    for topic in topics {
        let mut binding = LiveBinding::push(
            ctx.clone(),
            EnvelopeDecoder::<T>::new(),
            |message: Message<Envelope<T>>| print_message(&message),
        );
        let failed = topic.clone();
        binding.set_error_handler(move |error| print_error(&failed, &error));
        binding.activate(topic).await;
        bindings.push(binding);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    for binding in &mut bindings {
        binding.deactivate().await;
    }
    Ok(())
}

async fn watch_pull<T>(ctx: LiveContext, topics: Vec<Topic>, capacity: Option<usize>) -> Result<()>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    let mut bindings = Vec::with_capacity(topics.len());
    let mut printers = Vec::with_capacity(topics.len());
    for topic in topics {
        let mut binding = LiveBinding::pull(ctx.clone(), EnvelopeDecoder::<T>::new(), capacity);
        printers.push(tokio::spawn(print_pulled(
            topic.clone(),
            Arc::clone(binding.strategy()),
        )));
        binding.activate(topic).await;
        bindings.push(binding);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    for binding in &mut bindings {
        binding.deactivate().await;
    }
    for printer in printers {
        printer.abort();
    }
    for binding in &bindings {
        for message in binding.strategy().drain() {
            print_message(&message);
        }
    }
    Ok(())
}

/// Print whatever the buffer holds each time it changes.
async fn print_pulled<T>(topic: Topic, buffer: Arc<PullDelivery<Envelope<T>>>)
where
    T: Serialize + Send + 'static,
{
    let mut changes = buffer.subscribe();
    let mut reported: Option<LiveError> = None;
    loop {
        for message in buffer.drain() {
            print_message(&message);
        }
        let latest = buffer.latest_error();
        if latest != reported {
            if let Some(error) = &latest {
                print_error(&topic, error);
            }
            reported = latest;
        }
        if changes.changed().await.is_err() {
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct MessageLine<'a, T> {
    topic: &'a str,
    sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(flatten)]
    envelope: &'a Envelope<T>,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    topic: &'a str,
    error: &'static str,
    message: String,
}

fn message_line<T: Serialize>(message: &Message<Envelope<T>>) -> serde_json::Result<String> {
    serde_json::to_string(&MessageLine {
        topic: message.topic.as_str(),
        sequence: message.sequence,
        kind: ChangeKind::from_topic(&message.topic).map(ChangeKind::action),
        envelope: &message.value,
    })
}

fn error_line(topic: &Topic, error: &LiveError) -> serde_json::Result<String> {
    serde_json::to_string(&ErrorLine {
        topic: topic.as_str(),
        error: error.kind(),
        message: error.to_string(),
    })
}

fn print_message<T: Serialize>(message: &Message<Envelope<T>>) {
    match message_line(message) {
        Ok(line) => println!("{line}"),
        Err(error) => warn!(topic = %message.topic, %error, "failed to render message"),
    }
}

fn print_error(topic: &Topic, error: &LiveError) {
    warn!(%topic, kind = error.kind(), %error, "live subscription failed");
    match error_line(topic, error) {
        Ok(line) => println!("{line}"),
        Err(error) => warn!(%topic, %error, "failed to render error"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
