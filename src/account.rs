use {crate::model::types::AccountId, parking_lot::RwLock, thiserror::Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No account set")]
pub struct NoAccountSet;

/// Resolves which account the local client is currently acting for.
///
/// The repository only reads it; the client points it at an account on
/// register and clears it on unregister.
pub trait AccountProvider: Send + Sync {
    fn current_account(&self) -> Result<AccountId, NoAccountSet>;

    fn set_current_account(&self, account: Option<AccountId>);
}

#[derive(Debug, Default)]
pub struct CurrentAccount {
    account: RwLock<Option<AccountId>>,
}

impl CurrentAccount {
    pub fn new(account: Option<AccountId>) -> Self {
        Self {
            account: RwLock::new(account),
        }
    }
}

impl AccountProvider for CurrentAccount {
    fn current_account(&self) -> Result<AccountId, NoAccountSet> {
        self.account.read().clone().ok_or(NoAccountSet)
    }

    fn set_current_account(&self, account: Option<AccountId>) {
        *self.account.write() = account;
    }
}
