use std::sync::{PoisonError, RwLock};

use crate::domain::error::SyncError;

/// Текущий пользователь, как его видит провайдер аутентификации.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Внешний провайдер аутентификации: выдаёт стабильный идентификатор пользователя.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<Identity>;
}

/// Требует пользователя; без него мутирующие операции не начинаются.
pub(crate) fn require_identity(auth: &dyn AuthProvider) -> Result<Identity, SyncError> {
    auth.current_user()
        .filter(|identity| !identity.user_id.trim().is_empty())
        .ok_or(SyncError::NotAuthenticated)
}

/// Провайдер с явно заданным пользователем; `sign_out` сбрасывает его.
#[derive(Debug, Default)]
pub struct StaticAuth {
    identity: RwLock<Option<Identity>>,
}

impl StaticAuth {
    pub fn signed_in(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity: RwLock::new(Some(Identity {
                user_id: user_id.into(),
                display_name: display_name.into(),
            })),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn sign_out(&self) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
