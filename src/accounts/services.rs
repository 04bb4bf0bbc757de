use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use super::password;
use crate::store::{Account, AccountStore, Identifier, StoreError};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("account not found")]
    AccountNotFound,
    #[error("wrong password")]
    WrongPassword,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hash(#[from] anyhow::Error),
}

/// Look up the account behind `identifier` and check the password against
/// its stored hash. Not-found and wrong-password stay distinct outcomes;
/// the sign-in page tells them apart on purpose.
pub async fn verify_credentials(
    store: &dyn AccountStore,
    identifier: &Identifier,
    password_plain: &str,
) -> Result<Account, CredentialError> {
    let account = store
        .find(identifier)
        .await?
        .ok_or(CredentialError::AccountNotFound)?;
    if password::verify_password(password_plain, &account.password_hash)? {
        Ok(account)
    } else {
        Err(CredentialError::WrongPassword)
    }
}
