use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;

use crate::storage::schema::{
    allowance_entries, families, family_members, reward_values, sessions, tasks, users,
};

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub display_name: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = families)]
pub struct Family {
    pub id: i32,
    pub name: String,
    pub join_code: String,
    pub created_by: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = families)]
pub struct NewFamily<'a> {
    pub name: &'a str,
    pub join_code: &'a str,
    pub created_by: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = family_members)]
#[diesel(belongs_to(Family, foreign_key = family_id))]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct FamilyMember {
    pub id: i32,
    pub family_id: i32,
    pub user_id: i32,
    pub role: String,
    pub joined_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = family_members)]
pub struct NewFamilyMember<'a> {
    pub family_id: i32,
    pub user_id: i32,
    pub role: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(belongs_to(Family, foreign_key = family_id))]
pub struct Task {
    pub id: i32,
    pub family_id: i32,
    pub member_id: Option<i32>,
    pub for_all: bool,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub status: String,
    pub kind: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub days: i32,
    pub completed_at: Option<NaiveDateTime>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub family_id: i32,
    pub member_id: Option<i32>,
    pub for_all: bool,
    pub title: &'a str,
    pub description: &'a str,
    pub priority: &'a str,
    pub status: &'a str,
    pub kind: &'a str,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub days: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = reward_values)]
#[diesel(belongs_to(Family, foreign_key = family_id))]
pub struct RewardValue {
    pub id: i32,
    pub family_id: i32,
    pub priority: String,
    pub value_cents: i64,
}

#[derive(Insertable)]
#[diesel(table_name = reward_values)]
pub struct NewRewardValue<'a> {
    pub family_id: i32,
    pub priority: &'a str,
    pub value_cents: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = allowance_entries)]
#[diesel(belongs_to(Family, foreign_key = family_id))]
#[diesel(belongs_to(Task, foreign_key = task_id))]
pub struct AllowanceEntry {
    pub id: i32,
    pub family_id: i32,
    pub member_id: i32,
    pub task_id: i32,
    pub value_cents: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = allowance_entries)]
pub struct NewAllowanceEntry {
    pub family_id: i32,
    pub member_id: i32,
    pub task_id: i32,
    pub value_cents: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = sessions)]
#[diesel(primary_key(jti))]
pub struct Session {
    pub jti: String,
    pub user_id: i32,
    pub issued_at: NaiveDateTime,
    pub last_used_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession<'a> {
    pub jti: &'a str,
    pub user_id: i32,
}
