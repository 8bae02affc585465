//! Password hashing and credential checks.

use pepper_core::User;

use crate::{StoreResult, UserStore};

pub fn hash_password(password: &str, cost: u32) -> StoreResult<String> {
    Ok(bcrypt::hash(password, cost)?)
}

/// Malformed hashes verify as false.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

/// Look the user up by name and check the password. Unknown users and wrong
/// passwords both come back as `Ok(None)`.
pub async fn authenticate<S>(store: &S, username: &str, password: &str) -> StoreResult<Option<User>>
where
    S: UserStore + ?Sized,
{
    let Some(user) = store.find_user_by_username(username).await? else {
        return Ok(None);
    };
    if verify_password(password, &user.password_hash) {
        Ok(Some(user))
    } else {
        Ok(None)
    }
}
