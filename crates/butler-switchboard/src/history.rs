use butler_core::config::HistoryConfig;
use butler_db::Db;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// ~4 chars per token; matches the memory-context budget math.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Realtime,
    Email,
    None,
}

/// Channel → windowing strategy. Unknown channels behave like realtime chat.
fn strategy_for(channel: &str) -> Strategy {
    match channel {
        "telegram" | "whatsapp" | "slack" | "discord" => Strategy::Realtime,
        "email" => Strategy::Email,
        "api" | "mcp" => Strategy::None,
        _ => Strategy::Realtime,
    }
}

/// Load and format conversation history for a routed message.
///
/// Returns an empty string when the message has no thread, the channel
/// strategy is `none`, or anything goes wrong — history is contextual sugar
/// and must never block routing.
pub fn load_conversation_history(
    db: &Db,
    channel: &str,
    thread_id: Option<&str>,
    observed_at: DateTime<Utc>,
    config: &HistoryConfig,
) -> String {
    let Some(thread_id) = thread_id.filter(|t| !t.is_empty()) else {
        return String::new();
    };
    let strategy = strategy_for(channel);
    if strategy == Strategy::None {
        return String::new();
    }

    let loaded = match strategy {
        Strategy::Realtime => realtime_window(db, channel, thread_id, observed_at, config),
        Strategy::Email => email_chain(db, channel, thread_id, config),
        Strategy::None => unreachable!(),
    };
    match loaded {
        Ok(messages) if !messages.is_empty() => format_history_context(&messages),
        Ok(_) => String::new(),
        Err(e) => {
            warn!(channel, error = %e, "conversation history load failed; continuing without");
            String::new()
        }
    }
}

/// Realtime strategy: union of the time window and the count window,
/// deduplicated by message id and sorted chronologically.
fn realtime_window(
    db: &Db,
    channel: &str,
    thread_id: &str,
    observed_at: DateTime<Utc>,
    config: &HistoryConfig,
) -> Result<Vec<HistoryMessage>, butler_db::DbError> {
    let window_start = observed_at - Duration::minutes(config.max_time_window_minutes);

    let mut in_time_window = query_messages(
        db,
        "received_at > ?3 AND received_at <= ?4",
        rusqlite::params![
            channel,
            thread_id,
            window_start.to_rfc3339(),
            observed_at.to_rfc3339()
        ],
        None,
    )?;
    let by_count = query_messages(
        db,
        "received_at <= ?3",
        rusqlite::params![channel, thread_id, observed_at.to_rfc3339()],
        Some(config.max_message_count),
    )?;

    for message in by_count {
        if !in_time_window.iter().any(|m| m.id == message.id) {
            in_time_window.push(message);
        }
    }
    in_time_window.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));

    // Token budget applies to the union, oldest dropped first.
    drop_oldest_over_budget(&mut in_time_window, config.max_tokens);
    Ok(in_time_window)
}

/// Email strategy: the full thread oldest→newest, dropping oldest messages
/// until the chain fits the budget. The newest message is never dropped; if
/// even it alone exceeds the budget the result is empty.
fn email_chain(
    db: &Db,
    channel: &str,
    thread_id: &str,
    config: &HistoryConfig,
) -> Result<Vec<HistoryMessage>, butler_db::DbError> {
    let mut chain = query_messages(db, "1 = 1", rusqlite::params![channel, thread_id], None)?;
    chain.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
    drop_oldest_over_budget(&mut chain, config.email_max_tokens);
    Ok(chain)
}

fn drop_oldest_over_budget(messages: &mut Vec<HistoryMessage>, max_tokens: usize) {
    let budget_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let mut total: usize = messages.iter().map(|m| m.content.len()).sum();
    while messages.len() > 1 && total > budget_chars {
        let dropped = messages.remove(0);
        total -= dropped.content.len();
    }
    if messages.len() == 1 && total > budget_chars {
        messages.clear();
    }
}

/// Shared SELECT: `?1` = channel, `?2` = thread id; `extra_where` may bind
/// `?3`/`?4` from the caller's params.
fn query_messages(
    db: &Db,
    extra_where: &str,
    params: impl rusqlite::Params,
    limit: Option<usize>,
) -> Result<Vec<HistoryMessage>, butler_db::DbError> {
    // The count window reads newest-first then re-sorts; the time window's
    // order is irrelevant because the union is sorted afterwards.
    let limit_clause = match limit {
        Some(n) => format!("ORDER BY received_at DESC LIMIT {n}"),
        None => String::new(),
    };
    let sql = format!(
        "SELECT id,
                json_extract(request_context, '$.source_sender_identity'),
                normalized_text,
                received_at,
                coalesce(json_extract(request_context, '$.direction'), 'inbound')
         FROM message_inbox
         WHERE json_extract(request_context, '$.source_channel') = ?1
           AND json_extract(request_context, '$.source_thread_identity') = ?2
           AND {extra_where}
         {limit_clause}"
    );
    db.with(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            let received: String = row.get(3)?;
            let direction: String = row.get(4)?;
            Ok(HistoryMessage {
                id: row.get(0)?,
                sender_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                content: row.get(2)?,
                received_at: DateTime::parse_from_rfc3339(&received)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                direction: if direction == "outbound" {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                },
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
}

/// Render history for the classifier prompt.
///
/// Inbound: `**<sender>** (<ts>): <content>`
/// Outbound: `**butler → <sender>** (<ts>): <content>`
pub fn format_history_context(messages: &[HistoryMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Recent Conversation History\n\n");
    let formatted: Vec<String> = messages
        .iter()
        .map(|m| {
            let ts = m.received_at.to_rfc3339();
            match m.direction {
                Direction::Inbound => format!("**{}** ({}): {}", m.sender_id, ts, m.content),
                Direction::Outbound => {
                    format!("**butler → {}** ({}): {}", m.sender_id, ts, m.content)
                }
            }
        })
        .collect();
    out.push_str(&formatted.join("\n---\n"));
    out
}
