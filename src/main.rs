//! chatshield service entry point.
//!
//! Reads one JSON request per line on stdin and writes one JSON response per
//! line on stdout. Logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatshield::config::{SettingsUpdate, ShieldConfig, ThresholdsUpdate};
use chatshield::engine::{spawn_prune_task, ModerationEngine};
use chatshield::error::{ErrorContext, Result, ShieldError};
use chatshield::events::ModerationEvent;
use chatshield::history::{InMemoryHistoryStore, TtlHistoryStore, UserHistoryStore};
use chatshield::lexicon::Lexicon;
use chatshield::models::{ChatType, Message, NewViolation};

/// One line of input.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Evaluate {
        user_id: String,
        chat_id: String,
        text: String,
        #[serde(default)]
        chat_type: ChatType,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    PreviewSplit {
        user_id: String,
        chat_id: String,
        text: String,
    },
    Profile {
        user_id: String,
    },
    RecordViolation(NewViolation),
    SetMessageCount {
        user_id: String,
        count: u64,
    },
    UpdateSettings(SettingsUpdate),
    UpdateThresholds(ThresholdsUpdate),
    Stats,
    Metrics,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Self::Evaluate { .. } => "evaluate",
            Self::PreviewSplit { .. } => "preview_split",
            Self::Profile { .. } => "profile",
            Self::RecordViolation(_) => "record_violation",
            Self::SetMessageCount { .. } => "set_message_count",
            Self::UpdateSettings(_) => "update_settings",
            Self::UpdateThresholds(_) => "update_thresholds",
            Self::Stats => "stats",
            Self::Metrics => "metrics",
        }
    }

    fn user_id(&self) -> Option<&str> {
        match self {
            Self::Evaluate { user_id, .. }
            | Self::PreviewSplit { user_id, .. }
            | Self::Profile { user_id }
            | Self::SetMessageCount { user_id, .. } => Some(user_id.as_str()),
            Self::RecordViolation(v) => Some(v.user_id.as_str()),
            _ => None,
        }
    }
}

fn handle(engine: &ModerationEngine, request: Request) -> Result<Value> {
    let value = match request {
        Request::Evaluate {
            user_id,
            chat_id,
            text,
            chat_type,
            timestamp,
        } => {
            let message = Message::at(user_id, chat_id, text, timestamp.unwrap_or_else(Utc::now));
            serde_json::to_value(engine.evaluate(&message, chat_type)?)?
        }
        Request::PreviewSplit {
            user_id,
            chat_id,
            text,
        } => serde_json::to_value(engine.preview_split(&user_id, &chat_id, &text, Utc::now()))?,
        Request::Profile { user_id } => {
            let profile = engine.get_user_violation_profile(&user_id)?;
            let advisory = engine.advisory(&user_id)?;
            json!({ "profile": profile, "advisory": advisory })
        }
        Request::RecordViolation(violation) => {
            json!({ "violation_id": engine.record_violation(violation)? })
        }
        Request::SetMessageCount { user_id, count } => {
            engine.set_message_count(&user_id, count);
            json!({ "count": count })
        }
        Request::UpdateSettings(update) => serde_json::to_value(engine.update_settings(&update)?)?,
        Request::UpdateThresholds(update) => {
            serde_json::to_value(engine.update_thresholds(&update)?)?
        }
        Request::Stats => serde_json::to_value(engine.stats())?,
        Request::Metrics => json!({
            "prometheus": engine.stats().to_prometheus(),
            "event_subscribers": engine.subscriber_count(),
        }),
    };
    Ok(value)
}

fn respond(engine: &ModerationEngine, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            let err = ShieldError::from(e);
            err.log_with_context(&ErrorContext::new("parse_request"));
            return json!({ "ok": false, "error": err.to_string() });
        }
    };

    let mut context = ErrorContext::new(request.name());
    if let Some(user_id) = request.user_id() {
        context = context.with_user_id(user_id);
    }

    match handle(engine, request) {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => {
            e.log_with_context(&context);
            json!({
                "ok": false,
                "error": e.user_message(),
                "request_id": context.request_id,
            })
        }
    }
}

/// Log every moderation event until the bus closes.
fn spawn_event_logger(mut rx: broadcast::Receiver<Arc<ModerationEvent>>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.as_ref() {
                    ModerationEvent::ChatDeactivated {
                        user_id,
                        violation_percentage,
                        recent_attempts,
                        ..
                    } => tracing::warn!(
                        user_id = %user_id,
                        violation_percentage,
                        recent_attempts,
                        "Admin notification: chat deactivated"
                    ),
                    ModerationEvent::CircumventionEscalated {
                        user_id,
                        attempt_count,
                        risk_level,
                        ..
                    } => tracing::warn!(
                        user_id = %user_id,
                        attempt_count,
                        risk_level = ?risk_level,
                        "Admin notification: circumvention escalated"
                    ),
                    ModerationEvent::ViolationRecorded { .. } => {
                        tracing::debug!(user_id = %event.user_id(), "Violation event");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn build_store() -> Arc<dyn UserHistoryStore> {
    match std::env::var("HISTORY_STORE").as_deref() {
        Ok("memory") => Arc::new(InMemoryHistoryStore::new()),
        _ => Arc::new(TtlHistoryStore::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatshield=info")),
        )
        .init();

    tracing::info!(
        built = env!("BUILD_TIMESTAMP"),
        commit = env!("GIT_COMMIT"),
        "chatshield starting..."
    );

    let config = ShieldConfig::from_env()?;
    tracing::info!(
        blocked_words = config.filter.blocked_words.len(),
        critical_pct = config.thresholds.critical_percentage,
        "Configuration loaded"
    );

    let lexicon = Arc::new(Lexicon::new()?);
    let engine = Arc::new(ModerationEngine::new(
        lexicon,
        build_store(),
        config.filter,
        config.thresholds,
    )?);
    tracing::info!("Moderation engine initialized");

    let prune_secs = std::env::var("PRUNE_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);
    spawn_prune_task(engine.clone(), Duration::from_secs(prune_secs));
    spawn_event_logger(engine.subscribe());
    tracing::info!("Background tasks spawned");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ShieldError::Io(format!("Failed to read stdin: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&engine, &line);
        let mut out = response.to_string();
        out.push('\n');
        stdout
            .write_all(out.as_bytes())
            .await
            .map_err(|e| ShieldError::Io(format!("Failed to write stdout: {}", e)))?;
        stdout
            .flush()
            .await
            .map_err(|e| ShieldError::Io(format!("Failed to write stdout: {}", e)))?;
    }

    tracing::info!("Input closed, shutting down");
    Ok(())
}
