use crate::conversation::UserId;

/// Who is acting on this client. Authentication lives elsewhere; the core only
/// needs the resolved id.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> UserId;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedIdentity(pub UserId);

impl IdentityProvider for FixedIdentity {
    fn current_user(&self) -> UserId {
        self.0
    }
}
