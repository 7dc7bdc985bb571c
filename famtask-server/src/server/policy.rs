//! Access-policy predicates consumed by the task and family handlers.
//! Every check fails closed: a missing membership row denies the
//! action, never default-allows.

use famtask_shared::domain::FamilyRole;

use crate::storage::models::{Family, FamilyMember};

use super::{AppError, AppState, auth::AuthCtx};

/// The caller's family and membership row; `Forbidden` when the caller
/// belongs to no family.
pub async fn require_member(
    state: &AppState,
    auth: &AuthCtx,
) -> Result<(Family, FamilyMember), AppError> {
    match state
        .store
        .membership(auth.user_id)
        .await
        .map_err(AppError::internal)?
    {
        Some(found) => Ok(found),
        None => {
            tracing::warn!(username = %auth.username, "policy: caller has no family");
            Err(AppError::forbidden())
        }
    }
}

/// Like [`require_member`], but the caller must hold the ADMIN role.
pub async fn require_admin(
    state: &AppState,
    auth: &AuthCtx,
) -> Result<(Family, FamilyMember), AppError> {
    let (family, membership) = require_member(state, auth).await?;
    if membership.role != FamilyRole::Admin.as_str() {
        tracing::warn!(
            username = %auth.username,
            family_id = family.id,
            "policy: caller is not the family admin"
        );
        return Err(AppError::forbidden());
    }
    Ok((family, membership))
}

/// Both users must share a family; used for balance/ledger reads.
/// Returns the target's membership. A target outside the caller's
/// family reads as not-found rather than leaking its existence.
pub async fn require_same_family(
    state: &AppState,
    auth: &AuthCtx,
    target_user_id: i32,
) -> Result<FamilyMember, AppError> {
    let (family, _) = require_member(state, auth).await?;
    match state
        .store
        .membership(target_user_id)
        .await
        .map_err(AppError::internal)?
    {
        Some((target_family, target_membership)) if target_family.id == family.id => {
            Ok(target_membership)
        }
        _ => {
            tracing::warn!(
                username = %auth.username,
                target_user_id,
                "policy: target member not in caller's family"
            );
            Err(AppError::not_found(format!(
                "member not found: {}",
                target_user_id
            )))
        }
    }
}
