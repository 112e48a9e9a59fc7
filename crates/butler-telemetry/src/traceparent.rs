use uuid::Uuid;

/// W3C `traceparent` header value: `00-<trace_id>-<parent_id>-<flags>`.
///
/// Trace context crosses task and process boundaries as an explicit value —
/// never thread-local state — so a spawned runtime session can parent its
/// tool-call spans on the ingesting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: bool,
}

impl TraceParent {
    /// Start a brand-new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(32),
            span_id: random_hex(16),
            sampled: true,
        }
    }

    /// Mint a child span id within the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(16),
            sampled: self.sampled,
        }
    }

    /// Parse a `traceparent` header value. Returns `None` on any deviation
    /// from the version-00 format.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version != "00" || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !is_lower_hex(trace_id) || !is_lower_hex(span_id) || !is_lower_hex(flags) {
            return None;
        }
        // All-zero ids are invalid per the spec.
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled: u8::from_str_radix(flags, 16).map(|f| f & 1 == 1).unwrap_or(false),
        })
    }

    pub fn header_value(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{flags}", self.trace_id, self.span_id)
    }

    /// The `(key, value)` pair injected into a runtime subprocess env.
    pub fn env_pair(&self) -> (String, String) {
        ("traceparent".to_string(), self.header_value())
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn random_hex(chars: usize) -> String {
    // Two v4 UUIDs give 64 hex chars of randomness — enough for both id widths.
    let pool = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    pool[..chars].to_string()
}
