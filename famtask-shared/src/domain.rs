use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A value for one of the closed enums below that the wire or the
/// database does not recognize.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

/// Task priority. Wire spelling is the uppercase Portuguese form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Baixa,
    Media,
    Alta,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Baixa, Priority::Media, Priority::Alta];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Baixa => "BAIXA",
            Priority::Media => "MEDIA",
            Priority::Alta => "ALTA",
        }
    }

    /// Built-in reward value in cents, used when a family has no
    /// explicit row for this priority.
    pub fn default_reward_cents(&self) -> i64 {
        match self {
            Priority::Baixa => 100,
            Priority::Media => 200,
            Priority::Alta => 300,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BAIXA" => Ok(Priority::Baixa),
            "MEDIA" => Ok(Priority::Media),
            "ALTA" => Ok(Priority::Alta),
            _ => Err(UnknownValue {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Task status. Input is upper-cased before matching, so clients may
/// send any casing; storage always holds the canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pendente,
    EmAndamento,
    Concluida,
    Atrasado,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pendente => "PENDENTE",
            TaskStatus::EmAndamento => "EM_ANDAMENTO",
            TaskStatus::Concluida => "CONCLUIDA",
            TaskStatus::Atrasado => "ATRASADO",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDENTE" => Ok(TaskStatus::Pendente),
            "EM_ANDAMENTO" => Ok(TaskStatus::EmAndamento),
            "CONCLUIDA" => Ok(TaskStatus::Concluida),
            "ATRASADO" => Ok(TaskStatus::Atrasado),
            _ => Err(UnknownValue {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Recurring-daily vs one-off task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Diaria,
    Pontual,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Diaria => "diaria",
            TaskKind::Pontual => "pontual",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diaria" => Ok(TaskKind::Diaria),
            "pontual" => Ok(TaskKind::Pontual),
            _ => Err(UnknownValue {
                kind: "task kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Role within a family. The admin manages tasks and membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FamilyRole {
    Admin,
    Member,
}

impl FamilyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FamilyRole::Admin => "ADMIN",
            FamilyRole::Member => "MEMBER",
        }
    }
}

impl FromStr for FamilyRole {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(FamilyRole::Admin),
            "MEMBER" => Ok(FamilyRole::Member),
            _ => Err(UnknownValue {
                kind: "role",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("date_end {date_end} is before date_start {date_start}")]
pub struct InvalidDateRange {
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

/// Whole-day span of a task, derived once at creation and again on
/// explicit date edits. A single-day task has a span of zero.
pub fn day_span(date_start: NaiveDate, date_end: NaiveDate) -> Result<i32, InvalidDateRange> {
    if date_end < date_start {
        return Err(InvalidDateRange {
            date_start,
            date_end,
        });
    }
    Ok((date_end - date_start).num_days() as i32)
}

/// Whether the expiry sweep should flag a task as overdue. The
/// canonical staleness rule compares calendar dates only: a daily task
/// still open after its end date has passed is overdue.
pub fn is_stale(kind: TaskKind, status: TaskStatus, date_end: NaiveDate, today: NaiveDate) -> bool {
    kind == TaskKind::Diaria
        && matches!(status, TaskStatus::Pendente | TaskStatus::EmAndamento)
        && date_end < today
}
