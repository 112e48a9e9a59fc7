use tracing::debug;

use crate::error::Result;
use crate::store::MemoryStore;

/// ~4 chars per token, matching the budget math used across the pipeline.
const CHARS_PER_TOKEN: usize = 4;
const MAX_QUERY_TERMS: usize = 8;

/// Assemble a memory-context block for a runtime session prompt.
///
/// Relevance first (FTS over episode + fact text, driven by prompt keywords),
/// falling back to recency when nothing matches. Returns `None` when the
/// store holds nothing usable — the spawner then sends the base system prompt
/// untouched.
pub fn memory_context(
    store: &MemoryStore,
    prompt: &str,
    butler_name: &str,
    token_budget: usize,
) -> Result<Option<String>> {
    let char_budget = token_budget.saturating_mul(CHARS_PER_TOKEN);
    if char_budget == 0 {
        return Ok(None);
    }

    let mut snippets = match fts_query(store, prompt) {
        Ok(hits) if !hits.is_empty() => hits,
        // A degenerate FTS query string must never fail the session.
        Ok(_) | Err(_) => recent_items(store)?,
    };
    if snippets.is_empty() {
        return Ok(None);
    }

    let mut out = String::from("## Memory Context\n");
    let mut used = out.len();
    snippets.truncate(32);
    let mut wrote_any = false;
    for snippet in snippets {
        let line = format!("- {snippet}\n");
        if used + line.len() > char_budget {
            break;
        }
        used += line.len();
        out.push_str(&line);
        wrote_any = true;
    }
    if !wrote_any {
        return Ok(None);
    }
    debug!(butler = butler_name, chars = used, "memory context assembled");
    Ok(Some(out.trim_end().to_string()))
}

fn fts_query(store: &MemoryStore, prompt: &str) -> Result<Vec<String>> {
    let mut terms: Vec<String> = Vec::new();
    for word in prompt.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() > 3 && !terms.contains(&cleaned) {
            terms.push(cleaned);
        }
        if terms.len() >= MAX_QUERY_TERMS {
            break;
        }
    }
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    let query = terms
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ");

    Ok(store.db().with(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT content FROM memory_fts WHERE memory_fts MATCH ?1 ORDER BY rank LIMIT 32",
        )?;
        let rows = stmt.query_map([query.as_str()], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })?)
}

/// Recency fallback: newest active facts, then newest unexpired episodes.
fn recent_items(store: &MemoryStore) -> Result<Vec<String>> {
    Ok(store.db().with(|conn| {
        let now = chrono::Utc::now().to_rfc3339();
        let mut out: Vec<String> = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT content FROM facts WHERE validity = 'active'
             ORDER BY created_at DESC LIMIT 16",
        )?;
        out.extend(
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok()),
        );
        let mut stmt = conn.prepare(
            "SELECT content FROM episodes
             WHERE expires_at IS NULL OR expires_at > ?1
             ORDER BY created_at DESC LIMIT 16",
        )?;
        out.extend(
            stmt.query_map([now.as_str()], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok()),
        );
        Ok(out)
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Permanence;
    use butler_db::Db;

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new(Db::open_in_memory().unwrap()).unwrap();
        store
            .store_fact("user", "city", "Lives in Munich", "global", Permanence::Stable)
            .unwrap();
        store
            .store_episode("Booked flight tickets to Lisbon for August", "travel", None)
            .unwrap();
        store
    }

    #[test]
    fn relevant_content_is_selected_by_keyword() {
        let store = seeded_store();
        let context = memory_context(&store, "When is the Lisbon flight?", "travel", 3000)
            .unwrap()
            .unwrap();
        assert!(context.starts_with("## Memory Context"));
        assert!(context.contains("Lisbon"));
    }

    #[test]
    fn falls_back_to_recency_for_unmatched_prompts() {
        let store = seeded_store();
        let context = memory_context(&store, "zzz qqq", "travel", 3000).unwrap().unwrap();
        assert!(context.contains("Munich") || context.contains("Lisbon"));
    }

    #[test]
    fn empty_store_yields_none() {
        let store = MemoryStore::new(Db::open_in_memory().unwrap()).unwrap();
        assert!(memory_context(&store, "anything at all", "general", 3000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn budget_is_enforced() {
        let store = seeded_store();
        // One token ≈ 4 chars: far too small for any snippet line.
        assert!(memory_context(&store, "Lisbon", "travel", 4).unwrap().is_none());
    }
}
