use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};

use crate::domain::{FamilyRole, Priority, TaskKind, TaskStatus};

pub mod endpoints;

pub const API_V1_PREFIX: &str = "/api/v1";

/// One PATCH field: either left alone or explicitly set. JSON absence
/// deserializes to `Keep` (via `#[serde(default)]` on the field);
/// `null` on a nullable field deserializes to `Set(None)`. This keeps
/// "leave unchanged" and "explicitly clear" distinguishable.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate<T> {
    Keep,
    Set(T),
}

impl<T> FieldUpdate<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            FieldUpdate::Keep => None,
            FieldUpdate::Set(v) => Some(v),
        }
    }
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Keep
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FieldUpdate<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        T::deserialize(deserializer).map(FieldUpdate::Set)
    }
}

impl<T: Serialize> Serialize for FieldUpdate<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            // `Keep` fields are skipped at the struct level; a bare
            // `Keep` serializes as null as a fallback.
            FieldUpdate::Keep => serializer.serialize_none(),
            FieldUpdate::Set(v) => v.serialize(serializer),
        }
    }
}

// Auth
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterReq {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResp {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecoverReq {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetReq {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResp {
    pub ok: bool,
}

// Families
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateFamilyReq {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinFamilyReq {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemberDto {
    pub user_id: i32,
    pub username: String,
    pub display_name: String,
    pub role: FamilyRole,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FamilyDto {
    pub id: i32,
    pub name: String,
    pub join_code: String,
    pub members: Vec<MemberDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaveFamilyResp {
    pub family_deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RewardValueDto {
    pub priority: Priority,
    pub value_cents: i64,
}

// Tasks
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDto {
    pub id: i32,
    pub family_id: i32,
    pub member_id: Option<i32>,
    pub member_name: Option<String>,
    pub for_all: bool,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub kind: TaskKind,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub days: i32,
    /// RFC3339 UTC, present iff status == CONCLUIDA.
    pub completed_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskReq {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// None = claimable by anyone in the family ("for all").
    pub member_id: Option<i32>,
    pub priority: Priority,
    pub kind: TaskKind,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

/// Status is carried as a string and parsed case-insensitively
/// server-side, so bad values fail validation rather than
/// deserialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateTaskStatusReq {
    pub status: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskPatchReq {
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub title: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub description: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub priority: FieldUpdate<Priority>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub status: FieldUpdate<TaskStatus>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub kind: FieldUpdate<TaskKind>,
    /// `Set(None)` clears the assignee and makes the task for-all.
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub member: FieldUpdate<Option<i32>>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub date_start: FieldUpdate<NaiveDate>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_keep")]
    pub date_end: FieldUpdate<NaiveDate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResp {
    pub flagged: usize,
}

// Allowance
#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceDto {
    pub member_id: i32,
    pub balance_cents: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerEntryDto {
    /// RFC3339 UTC, equal to the task's completion time.
    pub time: String,
    pub task_id: i32,
    pub task_title: Option<String>,
    pub value_cents: i64,
}
