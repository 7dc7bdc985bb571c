use super::API_V1_PREFIX;

fn base_join(base: &str, path: &str) -> String {
    let b = base.trim_end_matches('/');
    let p = path.trim_start_matches('/');
    format!("{}/{}", b, p)
}

pub fn auth_register(base: &str) -> String {
    base_join(base, &format!("{}/auth/register", API_V1_PREFIX))
}
pub fn auth_login(base: &str) -> String {
    base_join(base, &format!("{}/auth/login", API_V1_PREFIX))
}
pub fn auth_logout(base: &str) -> String {
    base_join(base, &format!("{}/auth/logout", API_V1_PREFIX))
}
pub fn auth_recover(base: &str) -> String {
    base_join(base, &format!("{}/auth/recover", API_V1_PREFIX))
}
pub fn auth_reset(base: &str) -> String {
    base_join(base, &format!("{}/auth/reset", API_V1_PREFIX))
}

pub fn families(base: &str) -> String {
    base_join(base, &format!("{}/families", API_V1_PREFIX))
}
pub fn families_join(base: &str) -> String {
    base_join(base, &format!("{}/families/join", API_V1_PREFIX))
}
pub fn families_leave(base: &str) -> String {
    base_join(base, &format!("{}/families/leave", API_V1_PREFIX))
}
pub fn families_mine(base: &str) -> String {
    base_join(base, &format!("{}/families/mine", API_V1_PREFIX))
}
pub fn family_member_promote(base: &str, user_id: i32) -> String {
    base_join(
        base,
        &format!("{}/families/members/{}/promote", API_V1_PREFIX, user_id),
    )
}
pub fn family_rewards(base: &str) -> String {
    base_join(base, &format!("{}/families/rewards", API_V1_PREFIX))
}

pub fn tasks(base: &str) -> String {
    base_join(base, &format!("{}/tasks", API_V1_PREFIX))
}
pub fn task(base: &str, task_id: i32) -> String {
    base_join(base, &format!("{}/tasks/{}", API_V1_PREFIX, task_id))
}
pub fn task_status(base: &str, task_id: i32) -> String {
    base_join(base, &format!("{}/tasks/{}/status", API_V1_PREFIX, task_id))
}
pub fn tasks_sweep(base: &str) -> String {
    base_join(base, &format!("{}/tasks/sweep", API_V1_PREFIX))
}

pub fn member_allowance(base: &str, user_id: i32) -> String {
    base_join(
        base,
        &format!("{}/members/{}/allowance", API_V1_PREFIX, user_id),
    )
}
pub fn member_allowance_entries(base: &str, user_id: i32) -> String {
    base_join(
        base,
        &format!("{}/members/{}/allowance/entries", API_V1_PREFIX, user_id),
    )
}
