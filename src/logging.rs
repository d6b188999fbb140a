//! Logging setup.
//!
//! Two logical loggers with independent levels, as the configuration
//! exposes them: `app` (serial, MIB, device, model targets) and `snmp`
//! (agent and trap targets). Output goes to stdout and to a daily-rolling
//! file under `logs/`; INFO events whose message contains a configured
//! filter word are dropped.

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Drops INFO events whose formatted message contains any filter word.
struct WordFilter {
    words: Vec<String>,
}

fn message_blocked(words: &[String], message: &str) -> bool {
    words.iter().any(|word| message.contains(word))
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for WordFilter {
    fn event_enabled(&self, event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
        if self.words.is_empty() || *event.metadata().level() != Level::INFO {
            return true;
        }
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        !message_blocked(&self.words, &visitor.message)
    }
}

/// Install the global subscriber. The returned guard must stay alive for
/// the process lifetime or buffered file output is lost.
pub fn init(
    app_level: &str,
    snmp_level: &str,
    filter_words: Vec<String>,
) -> anyhow::Result<WorkerGuard> {
    let directives = format!(
        "{app},app={app},snmp={snmp}",
        app = app_level,
        snmp = snmp_level
    );
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| anyhow::anyhow!("invalid log level ({}): {}", directives, e))?;

    let file_appender = tracing_appender::rolling::daily("logs", "agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(WordFilter {
            words: filter_words,
        })
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialised: {}", e))?;

    Ok(guard)
}
