pub mod models;
pub mod schema;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use famtask_shared::api::FieldUpdate;
use famtask_shared::domain::{self, FamilyRole, Priority, TaskKind, TaskStatus};
use models::{
    AllowanceEntry, Family, FamilyMember, NewAllowanceEntry, NewFamily, NewFamilyMember,
    NewRewardValue, NewSession, NewTask, NewUser, RewardValue, Task, User,
};
use rand::Rng;
use tracing::warn;

/// Structured error type for all storage operations. Lifecycle and
/// membership rules are enforced here, inside the transaction that
/// reads the rows they depend on, so callers get a typed failure
/// instead of a torn write.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// The caller supplied invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced row does not exist (or is not visible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation would violate a uniqueness or lifecycle rule.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller is not allowed to perform this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

/// Everything needed to insert a task; validation (date range, policy)
/// happens before this is built.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub family_id: i32,
    pub member_id: Option<i32>,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub kind: TaskKind,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub days: i32,
}

/// Field-update cells for the admin PATCH operation. `Keep` leaves the
/// column untouched; `Set` overwrites it, including `Set(None)` on
/// `member` which clears the assignee and marks the task for-all.
#[derive(Debug, Clone, Default)]
pub struct TaskChanges {
    pub title: FieldUpdate<String>,
    pub description: FieldUpdate<String>,
    pub priority: FieldUpdate<Priority>,
    pub status: FieldUpdate<TaskStatus>,
    pub kind: FieldUpdate<TaskKind>,
    pub member: FieldUpdate<Option<i32>>,
    pub date_start: FieldUpdate<NaiveDate>,
    pub date_end: FieldUpdate<NaiveDate>,
}

const JOIN_CODE_LEN: usize = 8;
const JOIN_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const JOIN_CODE_ATTEMPTS: usize = 8;

fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_CHARSET[rng.gen_range(0..JOIN_CODE_CHARSET.len())] as char)
        .collect()
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    // Users

    pub async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<User, StorageError> {
        use schema::users;
        let pool = self.pool.clone();
        let username = username.to_string();
        let display_name = display_name.to_string();
        let email = email.to_string();
        let password_hash = password_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<User, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                let taken: i64 = users::table
                    .filter(users::username.eq(&username))
                    .count()
                    .get_result(conn)?;
                if taken > 0 {
                    return Err(StorageError::Conflict(format!(
                        "username already taken: {}",
                        username
                    )));
                }
                let taken: i64 = users::table
                    .filter(users::email.eq(&email))
                    .count()
                    .get_result(conn)?;
                if taken > 0 {
                    return Err(StorageError::Conflict(format!(
                        "email already registered: {}",
                        email
                    )));
                }
                let new_user = NewUser {
                    username: &username,
                    display_name: &display_name,
                    email: &email,
                    password_hash: &password_hash,
                };
                Ok(diesel::insert_into(users::table)
                    .values(&new_user)
                    .get_result::<User>(conn)?)
            })
        })
        .await?
    }

    pub async fn find_user_by_username(&self, name: &str) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users
                .filter(username.eq(&name))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn find_user_by_email(&self, addr: &str) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let addr = addr.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users
                .filter(email.eq(&addr))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn get_user(&self, user_id: i32) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users
                .filter(id.eq(user_id))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn set_password_hash(&self, user_id: i32, hash: &str) -> Result<(), StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let updated = diesel::update(users.filter(id.eq(user_id)))
                .set(password_hash.eq(&hash))
                .execute(&mut conn)?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("user {}", user_id)));
            }
            Ok(())
        })
        .await?
    }

    // Families & membership

    /// The caller's family and membership row, if any. A user belongs
    /// to at most one family.
    pub async fn membership(
        &self,
        user_id: i32,
    ) -> Result<Option<(Family, FamilyMember)>, StorageError> {
        use schema::{families, family_members};
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(
            move || -> Result<Option<(Family, FamilyMember)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                Ok(family_members::table
                    .inner_join(families::table)
                    .filter(family_members::user_id.eq(user_id))
                    .select((Family::as_select(), FamilyMember::as_select()))
                    .first::<(Family, FamilyMember)>(&mut conn)
                    .optional()?)
            },
        )
        .await?
    }

    pub async fn create_family(&self, user_id: i32, name: &str) -> Result<Family, StorageError> {
        use schema::{families, family_members, reward_values};
        let pool = self.pool.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<Family, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                ensure_no_membership(conn, user_id)?;

                // Join codes are random; on the off chance of a
                // collision, retry with a fresh code.
                let mut code = None;
                for _ in 0..JOIN_CODE_ATTEMPTS {
                    let candidate = generate_join_code();
                    let exists: i64 = families::table
                        .filter(families::join_code.eq(&candidate))
                        .count()
                        .get_result(conn)?;
                    if exists == 0 {
                        code = Some(candidate);
                        break;
                    }
                }
                let Some(code) = code else {
                    return Err(StorageError::Conflict(
                        "could not allocate a unique join code".to_string(),
                    ));
                };

                let family = diesel::insert_into(families::table)
                    .values(&NewFamily {
                        name: &name,
                        join_code: &code,
                        created_by: user_id,
                    })
                    .get_result::<Family>(conn)?;

                diesel::insert_into(family_members::table)
                    .values(&NewFamilyMember {
                        family_id: family.id,
                        user_id,
                        role: FamilyRole::Admin.as_str(),
                    })
                    .execute(conn)?;

                for priority in Priority::ALL {
                    diesel::insert_into(reward_values::table)
                        .values(&NewRewardValue {
                            family_id: family.id,
                            priority: priority.as_str(),
                            value_cents: priority.default_reward_cents(),
                        })
                        .execute(conn)?;
                }

                Ok(family)
            })
        })
        .await?
    }

    pub async fn join_family(&self, user_id: i32, code: &str) -> Result<Family, StorageError> {
        use schema::{families, family_members};
        let pool = self.pool.clone();
        let code = code.trim().to_ascii_uppercase();
        tokio::task::spawn_blocking(move || -> Result<Family, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                let family = families::table
                    .filter(families::join_code.eq(&code))
                    .first::<Family>(conn)
                    .optional()?
                    .ok_or_else(|| StorageError::NotFound(format!("unknown join code: {}", code)))?;

                ensure_no_membership(conn, user_id)?;

                diesel::insert_into(family_members::table)
                    .values(&NewFamilyMember {
                        family_id: family.id,
                        user_id,
                        role: FamilyRole::Member.as_str(),
                    })
                    .execute(conn)?;
                Ok(family)
            })
        })
        .await?
    }

    /// Remove the caller from their family. The last member leaving
    /// deletes the family; an admin with other members present must
    /// transfer the role first. Returns whether the family was deleted.
    pub async fn leave_family(&self, user_id: i32) -> Result<bool, StorageError> {
        use schema::{families, family_members};
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                let membership = family_members::table
                    .filter(family_members::user_id.eq(user_id))
                    .first::<FamilyMember>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::Forbidden("user does not belong to a family".to_string())
                    })?;

                let member_count: i64 = family_members::table
                    .filter(family_members::family_id.eq(membership.family_id))
                    .count()
                    .get_result(conn)?;

                if member_count == 1 {
                    // Cascades memberships, tasks, reward table and ledger.
                    diesel::delete(families::table.filter(families::id.eq(membership.family_id)))
                        .execute(conn)?;
                    return Ok(true);
                }

                if membership.role == FamilyRole::Admin.as_str() {
                    return Err(StorageError::Conflict(
                        "admin must transfer the role before leaving".to_string(),
                    ));
                }

                diesel::delete(family_members::table.filter(family_members::id.eq(membership.id)))
                    .execute(conn)?;
                Ok(false)
            })
        })
        .await?
    }

    /// Hand the ADMIN role to another member of the caller's family,
    /// demoting the caller to MEMBER.
    pub async fn transfer_admin(
        &self,
        caller_id: i32,
        target_user_id: i32,
    ) -> Result<(), StorageError> {
        use schema::family_members;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                let caller = family_members::table
                    .filter(family_members::user_id.eq(caller_id))
                    .first::<FamilyMember>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::Forbidden("user does not belong to a family".to_string())
                    })?;
                if caller.role != FamilyRole::Admin.as_str() {
                    return Err(StorageError::Forbidden(
                        "only the family admin can transfer the role".to_string(),
                    ));
                }
                if target_user_id == caller_id {
                    return Err(StorageError::InvalidInput(
                        "cannot transfer the admin role to yourself".to_string(),
                    ));
                }
                let target = family_members::table
                    .filter(family_members::family_id.eq(caller.family_id))
                    .filter(family_members::user_id.eq(target_user_id))
                    .first::<FamilyMember>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!(
                            "member not in family: {}",
                            target_user_id
                        ))
                    })?;

                diesel::update(family_members::table.filter(family_members::id.eq(target.id)))
                    .set(family_members::role.eq(FamilyRole::Admin.as_str()))
                    .execute(conn)?;
                diesel::update(family_members::table.filter(family_members::id.eq(caller.id)))
                    .set(family_members::role.eq(FamilyRole::Member.as_str()))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await?
    }

    pub async fn list_members(
        &self,
        family_id: i32,
    ) -> Result<Vec<(FamilyMember, User)>, StorageError> {
        use schema::{family_members, users};
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(FamilyMember, User)>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(family_members::table
                .inner_join(users::table)
                .filter(family_members::family_id.eq(family_id))
                .order(family_members::joined_at.asc())
                .select((FamilyMember::as_select(), User::as_select()))
                .load::<(FamilyMember, User)>(&mut conn)?)
        })
        .await?
    }

    // Reward table

    pub async fn reward_table(&self, family_id: i32) -> Result<Vec<RewardValue>, StorageError> {
        use schema::reward_values::dsl as rv;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<RewardValue>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(rv::reward_values
                .filter(rv::family_id.eq(family_id))
                .order(rv::id.asc())
                .load::<RewardValue>(&mut conn)?)
        })
        .await?
    }

    pub async fn set_reward_values(
        &self,
        family_id: i32,
        values: Vec<(Priority, i64)>,
    ) -> Result<(), StorageError> {
        use schema::reward_values::dsl as rv;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                for (priority, cents) in &values {
                    diesel::insert_into(rv::reward_values)
                        .values(&NewRewardValue {
                            family_id,
                            priority: priority.as_str(),
                            value_cents: *cents,
                        })
                        .on_conflict((rv::family_id, rv::priority))
                        .do_update()
                        .set(rv::value_cents.eq(*cents))
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await?
    }

    // Tasks

    pub async fn insert_task(&self, input: TaskInput) -> Result<Task, StorageError> {
        use schema::tasks;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new_task = NewTask {
                family_id: input.family_id,
                member_id: input.member_id,
                for_all: input.member_id.is_none(),
                title: &input.title,
                description: &input.description,
                priority: input.priority.as_str(),
                status: TaskStatus::Pendente.as_str(),
                kind: input.kind.as_str(),
                date_start: input.date_start,
                date_end: input.date_end,
                days: input.days,
            };
            Ok(diesel::insert_into(tasks::table)
                .values(&new_task)
                .get_result::<Task>(&mut conn)?)
        })
        .await?
    }

    pub async fn get_task(&self, task_id: i32) -> Result<Option<Task>, StorageError> {
        use schema::tasks::dsl::*;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Task>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(tasks
                .filter(id.eq(task_id))
                .filter(is_active.eq(true))
                .first::<Task>(&mut conn)
                .optional()?)
        })
        .await?
    }

    /// Active tasks for a family, newest first, with the assignee's
    /// display name where one is bound.
    pub async fn list_tasks(
        &self,
        family: i32,
    ) -> Result<Vec<(Task, Option<String>)>, StorageError> {
        use schema::{tasks, users};
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(
            move || -> Result<Vec<(Task, Option<String>)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                Ok(tasks::table
                    .left_join(users::table)
                    .filter(tasks::family_id.eq(family))
                    .filter(tasks::is_active.eq(true))
                    .order((tasks::created_at.desc(), tasks::id.desc()))
                    .select((Task::as_select(), users::display_name.nullable()))
                    .load::<(Task, Option<String>)>(&mut conn)?)
            },
        )
        .await?
    }

    /// Status transition, including the completion side effects: the
    /// actor must own the task or claim a for-all task from their own
    /// family. Completion binds the member, stamps `completed_at` and
    /// appends the allowance ledger entry, all in one transaction.
    /// Completing an already-completed task is a conflict, which is
    /// what makes the for-all claim race safe.
    pub async fn update_task_status(
        &self,
        task_id: i32,
        actor_user_id: i32,
        actor_family_id: i32,
        new_status: TaskStatus,
    ) -> Result<Task, StorageError> {
        use schema::tasks;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                let task = load_active_task(conn, task_id, actor_family_id)?;

                let current: TaskStatus = task
                    .status
                    .parse()
                    .map_err(|e: domain::UnknownValue| StorageError::InvalidInput(e.to_string()))?;

                // The completed check comes before ownership so a lost
                // for-all claim race reads as a conflict, not a denial.
                if new_status == TaskStatus::Concluida && current == TaskStatus::Concluida {
                    return Err(StorageError::Conflict(
                        "task is already completed".to_string(),
                    ));
                }

                if !task.for_all && task.member_id != Some(actor_user_id) {
                    return Err(StorageError::Forbidden(
                        "task belongs to another member".to_string(),
                    ));
                }

                if new_status == TaskStatus::Concluida {
                    let now = Utc::now().naive_utc();
                    diesel::update(tasks::table.filter(tasks::id.eq(task.id)))
                        .set((
                            tasks::status.eq(TaskStatus::Concluida.as_str()),
                            tasks::completed_at.eq(Some(now)),
                            tasks::member_id.eq(Some(actor_user_id)),
                            tasks::for_all.eq(false),
                        ))
                        .execute(conn)?;
                    append_allowance_entry(conn, &task, actor_user_id, now)?;
                } else {
                    // Includes the explicit "uncomplete" reversal back to
                    // PENDENTE; the ledger keeps its history, no reversal
                    // entry is written.
                    diesel::update(tasks::table.filter(tasks::id.eq(task.id)))
                        .set((
                            tasks::status.eq(new_status.as_str()),
                            tasks::completed_at.eq(None::<NaiveDateTime>),
                        ))
                        .execute(conn)?;
                }

                Ok(tasks::table
                    .filter(tasks::id.eq(task.id))
                    .first::<Task>(conn)?)
            })
        })
        .await?
    }

    /// Admin field patch. Date edits recompute `days`; a status edit
    /// maintains the completed_at invariant but never touches the
    /// ledger (allowance flows only through `update_task_status`).
    pub async fn patch_task(
        &self,
        task_id: i32,
        family_id: i32,
        changes: TaskChanges,
    ) -> Result<Task, StorageError> {
        use schema::{family_members, tasks};
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| {
                let task = load_active_task(conn, task_id, family_id)?;

                let current: TaskStatus = task
                    .status
                    .parse()
                    .map_err(|e: domain::UnknownValue| StorageError::InvalidInput(e.to_string()))?;

                let title = match changes.title {
                    FieldUpdate::Set(v) => v,
                    FieldUpdate::Keep => task.title.clone(),
                };
                let description = match changes.description {
                    FieldUpdate::Set(v) => v,
                    FieldUpdate::Keep => task.description.clone(),
                };
                let priority = match changes.priority {
                    FieldUpdate::Set(v) => v.as_str().to_string(),
                    FieldUpdate::Keep => task.priority.clone(),
                };
                let kind = match changes.kind {
                    FieldUpdate::Set(v) => v.as_str().to_string(),
                    FieldUpdate::Keep => task.kind.clone(),
                };

                let (member_id, for_all) = match changes.member {
                    FieldUpdate::Keep => (task.member_id, task.for_all),
                    FieldUpdate::Set(None) => (None, true),
                    FieldUpdate::Set(Some(uid)) => {
                        let in_family: i64 = family_members::table
                            .filter(family_members::family_id.eq(family_id))
                            .filter(family_members::user_id.eq(uid))
                            .count()
                            .get_result(conn)?;
                        if in_family == 0 {
                            return Err(StorageError::NotFound(format!(
                                "member not in family: {}",
                                uid
                            )));
                        }
                        (Some(uid), false)
                    }
                };

                let date_start = changes.date_start.into_option().unwrap_or(task.date_start);
                let date_end = changes.date_end.into_option().unwrap_or(task.date_end);
                let days = domain::day_span(date_start, date_end)
                    .map_err(|e| StorageError::InvalidInput(e.to_string()))?;

                let (status, completed_at) = match changes.status {
                    FieldUpdate::Keep => (current, task.completed_at),
                    FieldUpdate::Set(TaskStatus::Concluida) => {
                        let stamp = if current == TaskStatus::Concluida {
                            task.completed_at
                        } else {
                            Some(Utc::now().naive_utc())
                        };
                        (TaskStatus::Concluida, stamp)
                    }
                    FieldUpdate::Set(s) => (s, None),
                };

                diesel::update(tasks::table.filter(tasks::id.eq(task.id)))
                    .set((
                        tasks::title.eq(&title),
                        tasks::description.eq(&description),
                        tasks::priority.eq(&priority),
                        tasks::kind.eq(&kind),
                        tasks::member_id.eq(member_id),
                        tasks::for_all.eq(for_all),
                        tasks::date_start.eq(date_start),
                        tasks::date_end.eq(date_end),
                        tasks::days.eq(days),
                        tasks::status.eq(status.as_str()),
                        tasks::completed_at.eq(completed_at),
                    ))
                    .execute(conn)?;

                Ok(tasks::table
                    .filter(tasks::id.eq(task.id))
                    .first::<Task>(conn)?)
            })
        })
        .await?
    }

    /// Soft delete: the row stays for ledger history but disappears
    /// from every list and mutation path.
    pub async fn delete_task(&self, task_id: i32, family: i32) -> Result<(), StorageError> {
        use schema::tasks::dsl::*;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let updated = diesel::update(
                tasks
                    .filter(id.eq(task_id))
                    .filter(family_id.eq(family))
                    .filter(is_active.eq(true)),
            )
            .set(is_active.eq(false))
            .execute(&mut conn)?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("task not found: {}", task_id)));
            }
            Ok(())
        })
        .await?
    }

    /// The daily expiry sweep: flag open daily tasks whose end date has
    /// passed as ATRASADO. Each row is updated independently so one bad
    /// record cannot abort the batch; failures are logged and skipped.
    /// Running the sweep twice flags nothing new, since ATRASADO rows
    /// are out of the candidate set.
    pub async fn expire_stale_daily_tasks(
        &self,
        family: Option<i32>,
        today: NaiveDate,
    ) -> Result<usize, StorageError> {
        use schema::tasks::dsl::*;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;

            let mut candidates = tasks
                .filter(kind.eq(TaskKind::Diaria.as_str()))
                .filter(status.eq_any([
                    TaskStatus::Pendente.as_str(),
                    TaskStatus::EmAndamento.as_str(),
                ]))
                .filter(is_active.eq(true))
                .select(id)
                .into_boxed();
            if let Some(fam) = family {
                candidates = candidates.filter(family_id.eq(fam));
            }
            let candidate_ids = candidates.load::<i32>(&mut conn)?;

            let mut flagged = 0usize;
            for task_id in candidate_ids {
                let res = diesel::update(
                    tasks
                        .filter(id.eq(task_id))
                        .filter(date_end.lt(today))
                        .filter(status.eq_any([
                            TaskStatus::Pendente.as_str(),
                            TaskStatus::EmAndamento.as_str(),
                        ])),
                )
                .set(status.eq(TaskStatus::Atrasado.as_str()))
                .execute(&mut conn);
                match res {
                    Ok(n) => flagged += n,
                    Err(e) => {
                        warn!(task_id, error = %e, "expiry sweep: skipping row");
                    }
                }
            }
            Ok(flagged)
        })
        .await?
    }

    // Allowance ledger

    pub async fn balance_for_member(&self, member: i32) -> Result<i64, StorageError> {
        use diesel::dsl::sql;
        use diesel::sql_types::{BigInt, Nullable};
        use schema::allowance_entries::dsl as ae;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<i64, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let total: Option<i64> = ae::allowance_entries
                .filter(ae::member_id.eq(member))
                .select(sql::<Nullable<BigInt>>("SUM(value_cents)"))
                .first::<Option<i64>>(&mut conn)?;
            Ok(total.unwrap_or(0))
        })
        .await?
    }

    pub async fn list_allowance_entries(
        &self,
        member: i32,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<(AllowanceEntry, String)>, StorageError> {
        use schema::{allowance_entries, tasks};
        let pool = self.pool.clone();
        let page = page.max(1);
        let per_page = per_page.clamp(1, 1000) as i64;
        let offset = ((page as i64) - 1) * per_page;
        tokio::task::spawn_blocking(
            move || -> Result<Vec<(AllowanceEntry, String)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                Ok(allowance_entries::table
                    .inner_join(tasks::table)
                    .filter(allowance_entries::member_id.eq(member))
                    .order(allowance_entries::created_at.desc())
                    .offset(offset)
                    .limit(per_page)
                    .select((AllowanceEntry::as_select(), tasks::title))
                    .load::<(AllowanceEntry, String)>(&mut conn)?)
            },
        )
        .await?
    }

    // Session helpers for JWT inactivity windows

    pub async fn create_session(&self, jti_: &str, user: i32) -> Result<(), StorageError> {
        use schema::sessions;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new = NewSession {
                jti: &j,
                user_id: user,
            };
            diesel::insert_into(sessions::table)
                .values(&new)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn delete_session(&self, jti_: &str) -> Result<bool, StorageError> {
        use schema::sessions::dsl::*;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let deleted = diesel::delete(sessions.filter(jti.eq(&j))).execute(&mut conn)?;
            Ok(deleted > 0)
        })
        .await?
    }

    /// Touch session atomically, but only if it hasn't expired.
    /// Returns `true` if the session was found and updated, `false`
    /// otherwise. Combining the idle check and the update into one
    /// UPDATE removes the race between checking and touching.
    pub async fn touch_session_with_cutoff(
        &self,
        jti_: &str,
        cutoff: NaiveDateTime,
    ) -> Result<bool, StorageError> {
        use schema::sessions::dsl::*;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            let updated =
                diesel::update(sessions.filter(jti.eq(&j)).filter(last_used_at.ge(cutoff)))
                    .set(last_used_at.eq(now))
                    .execute(&mut conn)?;
            Ok(updated > 0)
        })
        .await?
    }
}

fn load_active_task(
    conn: &mut SqliteConnection,
    task_id: i32,
    family_id: i32,
) -> Result<Task, StorageError> {
    use schema::tasks;
    let task = tasks::table
        .filter(tasks::id.eq(task_id))
        .filter(tasks::is_active.eq(true))
        .first::<Task>(conn)
        .optional()?
        .ok_or_else(|| StorageError::NotFound(format!("task not found: {}", task_id)))?;
    // A task outside the caller's family is indistinguishable from a
    // missing one.
    if task.family_id != family_id {
        return Err(StorageError::NotFound(format!("task not found: {}", task_id)));
    }
    Ok(task)
}

/// Reward computation: the family's value for the task's priority (or
/// the built-in default when the row is missing), appended as one
/// ledger entry stamped with the completion time.
fn append_allowance_entry(
    conn: &mut SqliteConnection,
    task: &Task,
    member: i32,
    completed_at: NaiveDateTime,
) -> Result<(), StorageError> {
    use schema::{allowance_entries, reward_values};

    let priority: Priority = task
        .priority
        .parse()
        .map_err(|e: domain::UnknownValue| StorageError::InvalidInput(e.to_string()))?;

    let value: Option<i64> = reward_values::table
        .filter(reward_values::family_id.eq(task.family_id))
        .filter(reward_values::priority.eq(priority.as_str()))
        .select(reward_values::value_cents)
        .first::<i64>(conn)
        .optional()?;
    let value = value.unwrap_or_else(|| priority.default_reward_cents());

    diesel::insert_into(allowance_entries::table)
        .values(&NewAllowanceEntry {
            family_id: task.family_id,
            member_id: member,
            task_id: task.id,
            value_cents: value,
            created_at: completed_at,
        })
        .execute(conn)?;
    Ok(())
}

fn ensure_no_membership(conn: &mut SqliteConnection, user: i32) -> Result<(), StorageError> {
    use schema::family_members;
    let existing: i64 = family_members::table
        .filter(family_members::user_id.eq(user))
        .count()
        .get_result(conn)?;
    if existing > 0 {
        return Err(StorageError::Conflict(
            "user already belongs to a family".to_string(),
        ));
    }
    Ok(())
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys=ON;").execute(conn)?;
    Ok(())
}
