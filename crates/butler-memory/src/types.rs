use serde::{Deserialize, Serialize};

/// Durability class of a fact. Maps to the passive decay rate applied by the
/// consolidation sweep; more permanent classes decay strictly slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permanence {
    Permanent,
    Stable,
    Standard,
    Volatile,
    Ephemeral,
}

impl Permanence {
    pub fn decay_rate(&self) -> f64 {
        match self {
            Permanence::Permanent => 0.0,
            Permanence::Stable => 0.002,
            Permanence::Standard => 0.008,
            Permanence::Volatile => 0.03,
            Permanence::Ephemeral => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permanence::Permanent => "permanent",
            Permanence::Stable => "stable",
            Permanence::Standard => "standard",
            Permanence::Volatile => "volatile",
            Permanence::Ephemeral => "ephemeral",
        }
    }
}

impl std::str::FromStr for Permanence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(Permanence::Permanent),
            "stable" => Ok(Permanence::Stable),
            "standard" => Ok(Permanence::Standard),
            "volatile" => Ok(Permanence::Volatile),
            "ephemeral" => Ok(Permanence::Ephemeral),
            other => Err(format!("unknown permanence: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Active,
    Superseded,
    Retracted,
}

impl Validity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Validity::Active => "active",
            Validity::Superseded => "superseded",
            Validity::Retracted => "retracted",
        }
    }
}

/// Which memory table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Episode,
    Fact,
    Rule,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episode => "episode",
            MemoryKind::Fact => "fact",
            MemoryKind::Rule => "rule",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            MemoryKind::Episode => "episodes",
            MemoryKind::Fact => "facts",
            MemoryKind::Rule => "rules",
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "episode" => Ok(MemoryKind::Episode),
            "fact" => Ok(MemoryKind::Fact),
            "rule" => Ok(MemoryKind::Rule),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

/// A stored fact row.
#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    pub id: String,
    pub subject: String,
    pub predicate: String,
    pub content: String,
    pub scope: String,
    pub permanence: Permanence,
    pub validity: Validity,
    pub supersedes_id: Option<String>,
    pub reference_count: i64,
    pub last_referenced_at: Option<String>,
    pub created_at: String,
}

/// Generic view returned by `get_memory` for any kind.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: &'static str,
    pub content: String,
    pub reference_count: i64,
    pub last_referenced_at: Option<String>,
}
